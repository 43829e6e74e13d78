use serde::{Deserialize, Serialize};
use skein_error::{Error, ErrorKind, Result};
use std::collections::{BTreeMap, VecDeque};

/// One layer's configuration: string keys to string values.
pub type Params = BTreeMap<String, String>;

/// An ordered sequence of per-layer parameter maps, top layer first.
///
/// Each layer's resolver consumes the head map and recurses on the tail.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStack(VecDeque<Params>);

// === impl ParamStack ===

impl ParamStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Appends a map below every map pushed so far.
    pub fn push(&mut self, params: Params) -> &mut Self {
        self.0.push_back(params);
        self
    }

    /// Appends another stack's maps below this one's.
    pub fn append(&mut self, mut tail: ParamStack) -> &mut Self {
        self.0.append(&mut tail.0);
        self
    }

    /// Removes and returns the head map for the named layer.
    ///
    /// An empty stack is a missing-parameters error; a head map explicitly
    /// tagged with a different `layer` name is an invalid-argument error.
    pub fn pop_layer(&mut self, name: &str) -> Result<Params> {
        let params = self
            .0
            .pop_front()
            .ok_or_else(|| Error::new(ErrorKind::MissingConfigParameters))?;
        match params.get("layer") {
            None => Ok(params),
            Some(layer) if layer == name => Ok(params),
            Some(_) => Err(Error::new(ErrorKind::InvalidArgument)),
        }
    }

    pub fn serialize(&self) -> String {
        // Maps of strings always serialize.
        serde_json::to_string(self).expect("parameter stacks serialize")
    }

    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::with_source(ErrorKind::InvalidArgument, e))
    }

    /// Serializes an ordered list of stacks (circuit hop lists).
    pub fn serialize_list(stacks: &[ParamStack]) -> String {
        serde_json::to_string(stacks).expect("parameter stacks serialize")
    }

    pub fn parse_list(s: &str) -> Result<Vec<ParamStack>> {
        serde_json::from_str(s).map_err(|e| Error::with_source(ErrorKind::InvalidArgument, e))
    }
}

impl From<Vec<Params>> for ParamStack {
    fn from(maps: Vec<Params>) -> Self {
        Self(maps.into_iter().collect())
    }
}

/// Builds a `Params` map from `key => value` pairs.
#[macro_export]
macro_rules! params {
    ($($k:expr => $v:expr),* $(,)?) => {{
        let mut map = $crate::Params::new();
        $(map.insert($k.to_string(), $v.to_string());)*
        map
    }};
}

/// Fetches a required key or fails with `MissingConfigParameters`.
pub fn required<'p>(params: &'p Params, key: &str) -> Result<&'p str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::new(ErrorKind::MissingConfigParameters))
}

/// Fetches and parses a required key, failing with
/// `MissingConfigParameters` / `InvalidArgument` respectively.
pub fn required_parsed<T: std::str::FromStr>(params: &Params, key: &str) -> Result<T> {
    required(params, key)?
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidArgument))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_layer_consumes_top_first() {
        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "tls", "crt_src" => "file"]);
        stack.push(params!["layer" => "tcp", "port" => "9000"]);

        let tls = stack.pop_layer("tls").expect("tls head");
        assert_eq!(tls.get("crt_src").map(String::as_str), Some("file"));
        let tcp = stack.pop_layer("tcp").expect("tcp next");
        assert_eq!(tcp.get("port").map(String::as_str), Some("9000"));
        assert!(stack
            .pop_layer("tcp")
            .expect_err("exhausted")
            .is(ErrorKind::MissingConfigParameters));
    }

    #[test]
    fn pop_layer_rejects_mismatched_tag() {
        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "udp"]);
        assert!(stack
            .pop_layer("tcp")
            .expect_err("tag mismatch")
            .is(ErrorKind::InvalidArgument));
    }

    #[test]
    fn serialize_round_trips() {
        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "tcp", "addr" => "127.0.0.1", "port" => "9000"]);
        let parsed = ParamStack::parse(&stack.serialize()).expect("parse");
        assert_eq!(parsed, stack);
    }

    #[test]
    fn serialize_list_round_trips() {
        let mut a = ParamStack::new();
        a.push(params!["layer" => "tcp", "port" => "1"]);
        let mut b = ParamStack::new();
        b.push(params!["layer" => "tcp", "port" => "2"]);

        let s = ParamStack::serialize_list(&[a.clone(), b.clone()]);
        assert_eq!(ParamStack::parse_list(&s).expect("parse"), vec![a, b]);
        // And byte-for-byte stability for valid serializations.
        let again = ParamStack::serialize_list(&ParamStack::parse_list(&s).expect("parse"));
        assert_eq!(again, s);
    }

    #[test]
    fn required_distinguishes_missing_from_invalid() {
        let params = params!["port" => "not-a-number"];
        assert!(required(&params, "addr")
            .expect_err("missing")
            .is(ErrorKind::MissingConfigParameters));
        assert!(required_parsed::<u16>(&params, "port")
            .expect_err("invalid")
            .is(ErrorKind::InvalidArgument));
    }
}
