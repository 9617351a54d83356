use std::fmt::Display;

use serde_json::{json, Value};

pub mod hc_sr04;

pub trait MessageAble {
    fn to_json(&mut self) -> Value;
}

pub trait Sensor {
    type Error;
    type Status;

    fn get_unit(&self) -> &str;
    fn get_name(&self) -> &str;

    fn get_measurment(&mut self) -> Result<f32, Self::Error>;
    fn get_status(&mut self) -> Result<Self::Status, Self::Error>;
}

impl<ST, E, S> MessageAble for S
where
    ST: Display,
    E: std::fmt::Debug,
    S: Sensor<Error = E, Status = ST>,
{
    fn to_json(&mut self) -> Value {
        match (self.get_status(), self.get_measurment()) {
            (Ok(status), Ok(value)) => json!( {
                    "type": self.get_name(),
                    "value": value,
                    "status": status.to_string(),
                    "unit": self.get_unit()
            }),
            _ => json!( {
                    "type": self.get_name(),
                    "value": Value::Null,
                    "status": "Not connected",
            }),
        }
    }
}
