use crate::dbbat::common::Result;
use crate::dbbat::pg::protocol::{Message, Tag};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FormatCode {
    Text = 0,
    Binary = 1,
}

impl From<i16> for FormatCode {
    fn from(code: i16) -> Self {
        if code == 1 {
            FormatCode::Binary
        } else {
            FormatCode::Text
        }
    }
}

/// One column of a RowDescription, decoded to what result capture needs:
/// the column name, the type OID, and the value format.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: i32,
    pub format: FormatCode,
}

/// Decode a RowDescription message into its field descriptions.
pub fn parse_row_description(msg: &Message) -> Result<Vec<FieldDescription>> {
    debug_assert_eq!(msg.tag(), Tag::ROW_DESCRIPTION);
    let mut r = msg.reader();
    let num_fields = r.read_i16();
    let mut fields = Vec::with_capacity(num_fields.max(0) as usize);
    for _ in 0..num_fields {
        let name = r.read_str()?.to_string();
        let _table_oid = r.read_i32();
        let _column_attr = r.read_i16();
        let type_oid = r.read_i32();
        let _type_len = r.read_i16();
        let _type_mod = r.read_i32();
        let format = FormatCode::from(r.read_i16());
        r.error()?;
        fields.push(FieldDescription {
            name,
            type_oid,
            format,
        });
    }
    Ok(fields)
}
