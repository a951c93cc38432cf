//! Commands from the UI to the session
//!
//! Same shape the UI already uses for everything else: a numeric `param` plus a handful
//! of loosely typed values.  Numbers may arrive as json numbers or as strings.
use num::{FromPrimitive, ToPrimitive};
use serde_json::{json, Value};
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

#[derive(FromPrimitive, ToPrimitive, PartialEq, Eq, Debug, Clone, Copy)]
pub enum SessionParam {
    /// sValue: peer id
    Connect = 0,
    /// sValue: peer id
    Disconnect,
    /// iValue1..3: status, data1, data2
    SendEvent,
    /// fValue: msec
    SetBufferMs,
    /// sValue: comma separated peer ids, empty for none
    SetSoloSet,
    /// sValue: peer id, empty to clear
    SetBroadcastTarget,
    /// iValue1: 0 off, anything else on
    SetRelayMode,
    /// sValue: "solo" or "allow_list"
    SetFilterMode,
    Panic,
    GetStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamMessage {
    pub param: SessionParam,
    pub ivalue_1: i64,
    pub ivalue_2: i64,
    pub ivalue_3: i64,
    pub fvalue: f64,
    pub svalue: String,
}

// number that may have been sent as a string
fn int_field(raw: &Value, key: &str) -> Result<Option<i64>, BoxError> {
    match &raw[key] {
        Value::Number(n) => match n.as_i64() {
            Some(v) => Ok(Some(v)),
            None => bail!("{} is not an integer", key),
        },
        Value::String(s) => Ok(Some(s.trim().parse()?)),
        _ => Ok(None),
    }
}

fn float_field(raw: &Value, key: &str) -> Result<Option<f64>, BoxError> {
    match &raw[key] {
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => Ok(Some(s.trim().parse()?)),
        _ => Ok(None),
    }
}

impl ParamMessage {
    pub fn new(param: SessionParam) -> ParamMessage {
        ParamMessage {
            param,
            ivalue_1: 0,
            ivalue_2: 0,
            ivalue_3: 0,
            fvalue: 0.0,
            svalue: String::new(),
        }
    }
    pub fn with_str(param: SessionParam, sval: &str) -> ParamMessage {
        ParamMessage {
            svalue: String::from(sval),
            ..ParamMessage::new(param)
        }
    }
    pub fn as_json(&self) -> Value {
        json!({
          "param": self.param.to_i64(),
          "iValue1": self.ivalue_1,
          "iValue2": self.ivalue_2,
          "iValue3": self.ivalue_3,
          "fValue": self.fvalue,
          "sValue": self.svalue,
        })
    }
    pub fn from_string(data: &str) -> Result<ParamMessage, BoxError> {
        let raw: Value = serde_json::from_str(data)?;
        Self::from_json(&raw)
    }
    pub fn from_json(raw: &Value) -> Result<ParamMessage, BoxError> {
        let param = match int_field(raw, "param")? {
            Some(p) => p,
            None => bail!("no param in message"),
        };
        let param: SessionParam = match FromPrimitive::from_i64(param) {
            Some(p) => p,
            None => bail!("unknown param {}", param),
        };
        let mut msg = ParamMessage::new(param);
        if let Some(v) = int_field(raw, "iValue1")? {
            msg.ivalue_1 = v;
        }
        if let Some(v) = int_field(raw, "iValue2")? {
            msg.ivalue_2 = v;
        }
        if let Some(v) = int_field(raw, "iValue3")? {
            msg.ivalue_3 = v;
        }
        if let Some(v) = float_field(raw, "fValue")? {
            msg.fvalue = v;
        }
        if let Some(s) = raw["sValue"].as_str() {
            msg.svalue = String::from(s);
        }
        Ok(msg)
    }
    /// sValue split on commas, blanks dropped
    pub fn id_list(&self) -> Vec<String> {
        self.svalue
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
    /// the three midi bytes of a SendEvent
    pub fn midi_bytes(&self) -> Result<(u8, u8, u8), BoxError> {
        let to_byte = |v: i64| -> Result<u8, BoxError> {
            match v.to_u8() {
                Some(b) => Ok(b),
                None => bail!("{} does not fit in a byte", v),
            }
        };
        Ok((
            to_byte(self.ivalue_1)?,
            to_byte(self.ivalue_2)?,
            to_byte(self.ivalue_3)?,
        ))
    }
}

impl fmt::Display for ParamMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ param: {:?}, ival_1: {}, ival_2: {}, ival_3: {}, fval: {} sval: {} }}",
            self.param, self.ivalue_1, self.ivalue_2, self.ivalue_3, self.fvalue, self.svalue
        )
    }
}
