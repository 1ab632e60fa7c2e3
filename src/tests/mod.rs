/*
The integration tests compile into the library crate in this directory.

1) For speed (no external linking required)
2) For access to internals
3) So the whole suite runs against in-memory duplex streams, without a
   live PostgreSQL server

See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 */

mod common;

mod auth_test;
mod capture_test;
mod classifier_test;
