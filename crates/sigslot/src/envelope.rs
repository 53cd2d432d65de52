//! Message envelopes.
//!
//! An [`Envelope`] is the unit that travels through an event loop queue. It
//! names its destination by object id only, so the same value is valid in the
//! emitting thread, another thread, or another process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ObjectId;

/// Kind of envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Application data for a slot or broadcast subscribers.
    #[default]
    Normal,
    /// Finish the batch in hand, then leave `exec()`.
    Stop,
    /// Leave `exec()` immediately.
    Terminate,
}

/// Where an envelope is delivered inside the receiving loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// A single registered object.
    Object(ObjectId),
    /// Every subscriber of the signal named in the envelope.
    Broadcast,
    /// The loop itself (control envelopes).
    Loop,
}

/// Positional slot arguments.
///
/// Emitters pass a tuple, which serializes to a JSON array; slots name a tuple
/// type and get it back with [`Args::decode`]. `()` means no arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Converts an argument tuple into positional values.
    ///
    /// A value that does not serialize to an array counts as a single
    /// argument.
    pub fn encode<A: Serialize + ?Sized>(args: &A) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::to_value(args)? {
            Value::Null => Self::new(),
            Value::Array(values) => Self(values),
            single => Self(vec![single]),
        })
    }

    /// Rebuilds the typed argument tuple a slot expects.
    pub fn decode<A: DeserializeOwned>(&self) -> Result<A, serde_json::Error> {
        if self.0.is_empty() {
            if let Ok(unit) = serde_json::from_value(Value::Null) {
                return Ok(unit);
            }
        }

        match serde_json::from_value(Value::Array(self.0.clone())) {
            Ok(decoded) => Ok(decoded),
            Err(err) => match self.0.as_slice() {
                [single] => serde_json::from_value(single.clone()).map_err(|_| err),
                _ => Err(err),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

/// Unit of transport between an emission and its delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub destination: Destination,
    /// Slot name for object destinations, signal name for broadcasts.
    pub name: String,
    pub args: Args,
    pub control: Control,
}

impl Envelope {
    pub fn call(target: ObjectId, slot: impl Into<String>, args: Args) -> Self {
        Self {
            destination: Destination::Object(target),
            name: slot.into(),
            args,
            control: Control::Normal,
        }
    }

    pub fn broadcast(signal: impl Into<String>, args: Args) -> Self {
        Self {
            destination: Destination::Broadcast,
            name: signal.into(),
            args,
            control: Control::Normal,
        }
    }

    pub fn control(control: Control) -> Self {
        Self {
            destination: Destination::Loop,
            name: String::new(),
            args: Args::new(),
            control,
        }
    }

    pub fn is_control(&self) -> bool {
        self.control != Control::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tuples_become_positional_values() {
        let args = Args::encode(&("hello", 42)).unwrap();
        assert_eq!(args.values(), &[json!("hello"), json!(42)]);

        let (msg, n): (String, i64) = args.decode().unwrap();
        assert_eq!(msg, "hello");
        assert_eq!(n, 42);
    }

    #[test]
    fn unit_means_no_arguments() {
        let args = Args::encode(&()).unwrap();
        assert!(args.is_empty());
        let () = args.decode().unwrap();
    }

    #[test]
    fn single_argument_decodes_with_or_without_tuple() {
        let args = Args::encode(&(7,)).unwrap();
        assert_eq!(args.len(), 1);

        let (n,): (u32,) = args.decode().unwrap();
        assert_eq!(n, 7);
        let n: u32 = args.decode().unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn mismatched_shape_is_an_error() {
        let args = Args::encode(&("text",)).unwrap();
        assert!(args.decode::<(u32, u32)>().is_err());
    }

    #[test]
    fn control_envelopes_address_the_loop() {
        let env = Envelope::control(Control::Stop);
        assert_eq!(env.destination, Destination::Loop);
        assert!(env.is_control());
        assert!(!Envelope::broadcast("tick", Args::new()).is_control());
    }
}
