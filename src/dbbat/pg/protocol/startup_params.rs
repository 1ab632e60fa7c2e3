use crate::dbbat::common::{Error, Result};
use crate::dbbat::pg::protocol::{Message, MessageBuilder, Tag, PROTOCOL_VERSION};

/// Postgres identifiers (and application_name) are limited to NAMEDATALEN-1 bytes.
pub const MAX_NAME_LEN: usize = 63;

/// The key-value connection parameters from a StartupMessage, order-preserving.
#[derive(Clone, Debug, Default)]
pub struct StartupParams {
    params: Vec<(String, String)>,
}

impl StartupParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the parameters out of a startup message. The caller has already
    /// consumed and checked the protocol version.
    pub fn from_startup_message(msg: &Message) -> Result<Self> {
        let mut r = msg.reader();
        let version = r.read_i32();
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol_error(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let mut params = Self::new();
        loop {
            match r.peek() {
                None | Some(0) => break,
                Some(_) => {
                    let key = r.read_str()?;
                    let value = r.read_str()?;
                    params.add(key, value);
                }
            }
        }
        Ok(params)
    }

    pub fn add(&mut self, k: &str, v: &str) {
        self.params.push((k.to_string(), v.to_string()));
    }

    pub fn get(&self, k: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == k)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode these parameters as a StartupMessage for the upstream server.
    pub fn into_startup_message(self) -> Message {
        let mut mb = MessageBuilder::new(Tag::UNTAGGED);
        mb.write_i32(PROTOCOL_VERSION);
        for (k, v) in self.params.iter() {
            mb.write_str(k);
            mb.write_str(v);
        }
        mb.write_byte(0);
        mb.finish()
    }
}

/// Builds the application_name reported to the upstream server:
/// "dbbat-{version}" or "dbbat-{version} / {client_app}", truncated to
/// MAX_NAME_LEN bytes on a char boundary.
pub fn build_application_name(version: &str, client_app: &str) -> String {
    let mut name = format!("dbbat-{}", version);
    if !client_app.is_empty() {
        name.push_str(" / ");
        name.push_str(client_app);
    }
    if name.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}
