use crate::dbbat::pg::sql::{
    classify, copy_columns, split_statements, CopyDirection, CopyFormat, QueryType,
};

fn single(sql: &str) -> crate::dbbat::pg::sql::StatementInfo {
    let mut stmts = classify(sql);
    assert_eq!(stmts.len(), 1, "expected one statement in {:?}", sql);
    stmts.remove(0)
}

#[test]
fn test_query_type_detection() {
    let cases = [
        ("SELECT * FROM t", QueryType::Select),
        ("select 1", QueryType::Select),
        ("  \n\tINSERT INTO t VALUES (1)", QueryType::Insert),
        ("update t set a=1", QueryType::Update),
        ("DELETE FROM t", QueryType::Delete),
        ("MERGE INTO t USING s ON t.id=s.id WHEN MATCHED THEN DO NOTHING", QueryType::Merge),
        ("TRUNCATE t", QueryType::Truncate),
        ("CREATE TABLE t (a int)", QueryType::Create),
        ("ALTER TABLE t ADD COLUMN b int", QueryType::Alter),
        ("DROP TABLE t", QueryType::Drop),
        ("GRANT SELECT ON t TO u", QueryType::Grant),
        ("REVOKE SELECT ON t FROM u", QueryType::Revoke),
        ("CALL do_things()", QueryType::Call),
        ("BEGIN", QueryType::Begin),
        ("COMMIT", QueryType::Commit),
        ("SHOW server_version", QueryType::Show),
        ("EXPLAIN SELECT 1", QueryType::Explain),
        ("VACUUM t", QueryType::Vacuum),
        ("WITH x AS (SELECT 1) SELECT * FROM x", QueryType::With),
    ];
    for (sql, expected) in cases {
        assert_eq!(single(sql).query_type, expected, "for {:?}", sql);
    }
}

#[test]
fn test_write_detection() {
    for sql in [
        "INSERT INTO t VALUES (1)",
        "UPDATE t SET a=1",
        "DELETE FROM t",
        "MERGE INTO t USING s ON 1=1 WHEN MATCHED THEN DO NOTHING",
        "TRUNCATE t",
        "CALL mutate()",
        "SELECT a, b INTO newtable FROM t",
        "WITH moved AS (DELETE FROM t RETURNING *) SELECT count(*) FROM moved",
        "COPY t FROM stdin",
    ] {
        assert!(single(sql).is_write(), "should be a write: {:?}", sql);
    }
    for sql in [
        "SELECT * FROM t",
        "SELECT a FROM t WHERE b IN (SELECT c FROM s)",
        "WITH x AS (SELECT 1) SELECT * FROM x",
        "SHOW all",
        "COPY t TO stdout",
        "EXPLAIN SELECT 1",
    ] {
        assert!(!single(sql).is_write(), "should not be a write: {:?}", sql);
    }
}

#[test]
fn test_comments_do_not_hide_keywords() {
    let stmt = single("/* harmless */ -- nope\n  UPDATE t SET a=1");
    assert_eq!(stmt.query_type, QueryType::Update);
    let stmt = single("/* outer /* nested */ still comment */ DELETE FROM t");
    assert_eq!(stmt.query_type, QueryType::Delete);
}

#[test]
fn test_keywords_inside_literals_are_ignored() {
    let stmt = single("SELECT 'DROP TABLE users' FROM t");
    assert_eq!(stmt.query_type, QueryType::Select);
    assert!(!stmt.is_ddl());
    let stmt = single("SELECT $tag$ DELETE FROM x; $tag$");
    assert_eq!(stmt.query_type, QueryType::Select);
    let stmts = classify("SELECT E'a;b\\'c'; SELECT 2");
    assert_eq!(stmts.len(), 2);
}

#[test]
fn test_multi_statement_split() {
    let stmts = split_statements("SELECT 1; UPDATE t SET a=1; SELECT 2");
    assert_eq!(stmts, vec!["SELECT 1", "UPDATE t SET a=1", "SELECT 2"]);
    // any statement tripping a rule taints the whole batch
    let classified = classify("SELECT 1; UPDATE t SET a=1");
    assert!(classified.iter().any(|s| s.is_write()));
    // trailing semicolon produces no empty statement
    assert_eq!(split_statements("SELECT 1;").len(), 1);
    assert_eq!(split_statements("  ;;  ").len(), 0);
}

#[test]
fn test_read_only_bypass_attempts() {
    for sql in [
        "SET default_transaction_read_only = off",
        "SET SESSION default_transaction_read_only = off",
        "set DEFAULT_TRANSACTION_READ_ONLY to off",
        "SET transaction_read_only = off",
        "RESET default_transaction_read_only",
        "RESET ALL",
        "SET SESSION AUTHORIZATION other_user",
        "SET session_authorization = 'other_user'",
        "SET ROLE admin",
        "SET TRANSACTION READ WRITE",
        "BEGIN READ WRITE",
    ] {
        assert!(single(sql).read_only_bypass, "should be a bypass: {:?}", sql);
    }
    for sql in [
        "SET statement_timeout = 0",
        "SET search_path TO public",
        "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        "BEGIN",
        "RESET statement_timeout",
    ] {
        assert!(!single(sql).read_only_bypass, "should not be a bypass: {:?}", sql);
    }
}

#[test]
fn test_password_change_detection() {
    for sql in [
        "ALTER USER bob WITH PASSWORD 'x'",
        "alter role bob password 'x'",
        "ALTER USER bob WITH ENCRYPTED PASSWORD 'x'",
    ] {
        assert!(single(sql).password_change, "should be flagged: {:?}", sql);
    }
    for sql in [
        "ALTER USER bob SET statement_timeout = 0",
        "ALTER TABLE password ADD COLUMN x int",
        "SELECT password FROM users",
    ] {
        assert!(!single(sql).password_change, "should not be flagged: {:?}", sql);
    }
}

#[test]
fn test_copy_parsing() {
    let stmt = single("COPY tbl (a, b, c) FROM stdin");
    let copy = stmt.copy.as_ref().expect("copy info");
    assert_eq!(copy.direction, CopyDirection::In);
    assert_eq!(copy.format, CopyFormat::Text);
    assert_eq!(copy.columns, vec!["a", "b", "c"]);
    assert!(stmt.is_write());

    let stmt = single("COPY schema1.tbl TO stdout WITH (FORMAT csv, HEADER true)");
    let copy = stmt.copy.as_ref().unwrap();
    assert_eq!(copy.direction, CopyDirection::Out);
    assert_eq!(copy.format, CopyFormat::Csv);
    assert!(copy.columns.is_empty());
    assert!(!stmt.is_write());

    let stmt = single("COPY tbl (\"Weird Name\", plain) TO stdout BINARY");
    let copy = stmt.copy.as_ref().unwrap();
    assert_eq!(copy.format, CopyFormat::Binary);
    assert_eq!(copy.columns, vec!["Weird Name", "plain"]);

    let stmt = single("COPY (SELECT a FROM t WHERE b > 1) TO stdout");
    let copy = stmt.copy.as_ref().unwrap();
    assert_eq!(copy.direction, CopyDirection::Out);
    assert!(copy.columns.is_empty());

    assert_eq!(copy_columns("COPY t (x, y) FROM stdin"), vec!["x", "y"]);
    assert!(copy_columns("SELECT 1").is_empty());
}

#[test]
fn test_quoted_identifiers_fold_correctly() {
    // unquoted column names fold to lowercase like the server does
    let stmt = single("COPY t (Alpha, \"Beta\") FROM stdin");
    let copy = stmt.copy.unwrap();
    assert_eq!(copy.columns, vec!["alpha", "Beta"]);
}

#[test]
fn test_set_via_quoted_guc_name() {
    assert!(single("SET \"default_transaction_read_only\" = off").read_only_bypass);
}
