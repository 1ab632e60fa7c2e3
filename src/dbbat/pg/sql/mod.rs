mod classifier;
mod query_type;

pub use self::classifier::{
    classify, copy_columns, split_statements, CopyDirection, CopyFormat, CopyInfo, StatementInfo,
};
pub use self::query_type::QueryType;
