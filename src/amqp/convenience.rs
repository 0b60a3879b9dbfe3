use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// Lookup a header boolean value.
    ///
    /// Publishers that cannot emit AMQP booleans often send `"true"`/`"false"` strings,
    /// so those are accepted too. Returns `None` for anything else.
    fn get_header_bool<Q>(&self, key: &Q) -> Option<bool>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::Boolean(b)) => Some(*b),
            Some(AMQPValue::LongString(_)) | Some(AMQPValue::ShortString(_)) => {
                match self.get_header_str(key)?.trim() {
                    s if s.eq_ignore_ascii_case("true") => Some(true),
                    s if s.eq_ignore_ascii_case("false") => Some(false),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` gives no mutable access to headers, so they are cloned. `properties` is consumed
/// to make sure the caller does not re-use it under the impression that it was mutated.
///
/// # Example
///
/// ```rust
/// use burrow::amqp::types::{AMQPValue, ShortString};
/// use burrow::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
/// let header_value = AMQPValue::Boolean(true);
///
/// let properties = set_header(properties, "x-compressed", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "x-compressed".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
