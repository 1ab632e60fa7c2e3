use crate::dbbat::common::Result;
use crate::dbbat::pg::protocol::{Message, Tag};

/// Parse the textual tag out of a CommandComplete message ("UPDATE 5",
/// "SELECT 17", "INSERT 0 3", "COPY 100", "BEGIN", ...).
pub fn parse_command_tag(msg: &Message) -> Result<String> {
    debug_assert_eq!(msg.tag(), Tag::COMMAND_COMPLETE);
    let mut r = msg.reader();
    Ok(r.read_str()?.to_string())
}

/// Extract the affected/returned row count from a command tag, if it has one.
/// For all command tags that carry a row count it is the last
/// whitespace-separated part of the tag.
pub fn rows_affected(tag: &str) -> Option<i64> {
    let last = tag.rsplit(' ').next()?;
    last.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_affected() {
        assert_eq!(rows_affected("UPDATE 5"), Some(5));
        assert_eq!(rows_affected("SELECT 17"), Some(17));
        assert_eq!(rows_affected("INSERT 0 3"), Some(3));
        assert_eq!(rows_affected("COPY 100"), Some(100));
        assert_eq!(rows_affected("DELETE 0"), Some(0));
        assert_eq!(rows_affected("BEGIN"), None);
        assert_eq!(rows_affected("CREATE TABLE"), None);
    }
}
