use crate::amqp::convenience::BasicPropertiesExt;
use lapin::BasicProperties;

pub const OBJECT_TYPE_HEADER: &str = "x-object-type";
pub const ENCRYPTED_HEADER: &str = "x-encrypted";
pub const ENCRYPTION_HEADER: &str = "x-encryption";
pub const ENCRYPTED_AT_HEADER: &str = "x-encrypt-date";
pub const COMPRESSED_HEADER: &str = "x-compressed";
pub const COMPRESSION_HEADER: &str = "x-compression";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header `{0}` is not a string")]
    NotAString(&'static str),
    #[error("Header `{0}` is not a boolean")]
    NotABool(&'static str),
}

/// Metadata a publisher attached to a message through well-known headers.
///
/// Missing headers leave the matching field at its default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// What the payload holds, from the `x-object-type` header.
    pub content_type: Option<String>,
    pub encrypted: bool,
    pub encryption_type: Option<String>,
    /// When the payload was encrypted, as sent by the publisher.
    pub encrypted_at: Option<String>,
    pub compressed: bool,
    pub compression_type: Option<String>,
}

impl MessageHeaders {
    /// Decode the known headers, failing on the first malformed one.
    pub fn from_properties(properties: &BasicProperties) -> Result<Self, HeaderError> {
        let (headers, errors) = Self::decode(properties);
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(headers),
        }
    }

    /// Decode whatever can be decoded, collecting the errors instead of stopping at them.
    pub(crate) fn decode(properties: &BasicProperties) -> (Self, Vec<HeaderError>) {
        let mut errors = Vec::new();
        let headers = Self {
            content_type: lenient(string_header(properties, OBJECT_TYPE_HEADER), &mut errors),
            encrypted: lenient(bool_header(properties, ENCRYPTED_HEADER), &mut errors)
                .unwrap_or(false),
            encryption_type: lenient(string_header(properties, ENCRYPTION_HEADER), &mut errors),
            encrypted_at: lenient(string_header(properties, ENCRYPTED_AT_HEADER), &mut errors),
            compressed: lenient(bool_header(properties, COMPRESSED_HEADER), &mut errors)
                .unwrap_or(false),
            compression_type: lenient(string_header(properties, COMPRESSION_HEADER), &mut errors),
        };
        (headers, errors)
    }
}

fn lenient<T>(result: Result<Option<T>, HeaderError>, errors: &mut Vec<HeaderError>) -> Option<T> {
    result.unwrap_or_else(|e| {
        errors.push(e);
        None
    })
}

fn string_header(
    properties: &BasicProperties,
    name: &'static str,
) -> Result<Option<String>, HeaderError> {
    if properties.get_header(name).is_none() {
        return Ok(None);
    }
    properties
        .get_header_str(name)
        .map(|value| Some(value.into_owned()))
        .ok_or(HeaderError::NotAString(name))
}

fn bool_header(properties: &BasicProperties, name: &'static str) -> Result<Option<bool>, HeaderError> {
    if properties.get_header(name).is_none() {
        return Ok(None);
    }
    properties
        .get_header_bool(name)
        .map(Some)
        .ok_or(HeaderError::NotABool(name))
}
