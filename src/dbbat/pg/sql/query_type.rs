use strum::Display;

/// Statement classes the policy engine cares about. Everything it has no
/// opinion on is Other and passes through untouched.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum QueryType {
    Other,
    Select,
    SelectInto,
    With,
    Insert,
    Update,
    Delete,
    Merge,
    Truncate,
    Call,
    Do,
    Begin,    // includes START
    Commit,   // includes END
    Rollback, // includes ABORT
    Savepoint,
    Show,
    SetSession,
    SetLocal,
    SetTransaction,
    SetRole, // and SET SESSION AUTHORIZATION
    Reset,
    Alter,
    Create,
    Drop,
    Grant,
    Revoke,
    Copy,
    Prepare,
    Execute,
    Deallocate,
    Explain,
    Values,
    Cursor, // includes DECLARE, FETCH, MOVE, CLOSE
    Listen,
    Unlisten,
    Notify,
    Lock,
    Vacuum,
}

impl QueryType {
    /// Plain data modification, plus the statements that modify data while
    /// pretending not to (SELECT INTO, CALL, COPY FROM is handled separately).
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            QueryType::Insert
                | QueryType::Update
                | QueryType::Delete
                | QueryType::Merge
                | QueryType::Truncate
                | QueryType::SelectInto
                | QueryType::Call
        )
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, QueryType::Create | QueryType::Alter | QueryType::Drop)
    }

    pub fn is_dcl(&self) -> bool {
        matches!(self, QueryType::Grant | QueryType::Revoke)
    }
}

impl From<&str> for QueryType {
    /// Classify from the normalized statement head: uppercased keywords,
    /// comments stripped, single spaces.
    fn from(normalized: &str) -> Self {
        if normalized.is_empty() {
            return Self::Other;
        }
        match normalized.as_bytes()[0] {
            b'A' => {
                if normalized.starts_with("ALTER") {
                    return Self::Alter;
                } else if normalized.starts_with("ABORT") {
                    return Self::Rollback;
                }
            }
            b'B' => {
                if normalized.starts_with("BEGIN") {
                    return Self::Begin;
                }
            }
            b'C' => {
                if normalized.starts_with("COMMIT") {
                    return Self::Commit;
                } else if normalized.starts_with("CALL") {
                    return Self::Call;
                } else if normalized.starts_with("CREATE") {
                    return Self::Create;
                } else if normalized.starts_with("COPY") {
                    return Self::Copy;
                } else if normalized.starts_with("CLOSE") {
                    return Self::Cursor;
                }
            }
            b'D' => {
                if normalized.starts_with("DELETE") {
                    return Self::Delete;
                } else if normalized.starts_with("DROP") {
                    return Self::Drop;
                } else if normalized.starts_with("DECLARE") {
                    return Self::Cursor;
                } else if normalized.starts_with("DEALLOCATE") {
                    return Self::Deallocate;
                } else if normalized.starts_with("DO") {
                    return Self::Do;
                }
            }
            b'E' => {
                if normalized.starts_with("END") {
                    return Self::Commit;
                } else if normalized.starts_with("EXECUTE") {
                    return Self::Execute;
                } else if normalized.starts_with("EXPLAIN") {
                    return Self::Explain;
                }
            }
            b'F' => {
                if normalized.starts_with("FETCH") {
                    return Self::Cursor;
                }
            }
            b'G' => {
                if normalized.starts_with("GRANT") {
                    return Self::Grant;
                }
            }
            b'I' => {
                if normalized.starts_with("INSERT") {
                    return Self::Insert;
                }
            }
            b'L' => {
                if normalized.starts_with("LOCK") {
                    return Self::Lock;
                } else if normalized.starts_with("LISTEN") {
                    return Self::Listen;
                }
            }
            b'M' => {
                if normalized.starts_with("MERGE") {
                    return Self::Merge;
                } else if normalized.starts_with("MOVE") {
                    return Self::Cursor;
                }
            }
            b'N' => {
                if normalized.starts_with("NOTIFY") {
                    return Self::Notify;
                }
            }
            b'P' => {
                if normalized.starts_with("PREPARE") {
                    return Self::Prepare;
                }
            }
            b'R' => {
                if normalized.starts_with("ROLLBACK") {
                    return Self::Rollback;
                } else if normalized.starts_with("REVOKE") {
                    return Self::Revoke;
                } else if normalized.starts_with("RESET") {
                    return Self::Reset;
                }
            }
            b'S' => {
                if normalized.starts_with("SELECT") {
                    return if normalized[6..].trim_start().starts_with("INTO ") {
                        Self::SelectInto
                    } else {
                        Self::Select
                    };
                } else if normalized.starts_with("SET") {
                    // "TRANSACTION " with the space: the GUC named
                    // transaction_read_only must stay a plain SET
                    let next = normalized[3..].trim_start();
                    return if next.starts_with("LOCAL ") {
                        Self::SetLocal
                    } else if next.starts_with("TRANSACTION ") {
                        Self::SetTransaction
                    } else if next.starts_with("ROLE ")
                        || next.starts_with("SESSION AUTHORIZATION")
                    {
                        Self::SetRole
                    } else {
                        Self::SetSession
                    };
                } else if normalized.starts_with("START") {
                    return Self::Begin;
                } else if normalized.starts_with("SHOW") {
                    return Self::Show;
                } else if normalized.starts_with("SAVEPOINT") {
                    return Self::Savepoint;
                }
            }
            b'T' => {
                if normalized.starts_with("TRUNCATE") {
                    return Self::Truncate;
                } else if normalized.starts_with("TABLE") {
                    return Self::Select;
                }
            }
            b'U' => {
                if normalized.starts_with("UPDATE") {
                    return Self::Update;
                } else if normalized.starts_with("UNLISTEN") {
                    return Self::Unlisten;
                }
            }
            b'V' => {
                if normalized.starts_with("VACUUM") {
                    return Self::Vacuum;
                } else if normalized.starts_with("VALUES") {
                    return Self::Values;
                }
            }
            b'W' => {
                if normalized.starts_with("WITH") {
                    return Self::With;
                }
            }
            _ => (),
        }
        Self::Other
    }
}
