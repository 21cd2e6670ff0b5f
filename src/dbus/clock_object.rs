//! Clock bus object on the manager path

use super::manager::BusError;
use crate::clock::{Clock, TimeUpdates};
use std::collections::HashMap;
use std::sync::Arc;
use zbus::interface;
use zbus::zvariant::{OwnedValue, Value};

pub struct ClockInterface {
    clock: Arc<Clock>,
}

impl ClockInterface {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self { clock }
    }
}

#[interface(name = "net.connctl.Clock")]
impl ClockInterface {
    async fn get_properties(&self) -> HashMap<String, OwnedValue> {
        let properties = self.clock.properties().await;
        let mut dict = HashMap::new();

        super::insert_value(&mut dict, "Time", Value::from(properties.time));
        super::insert_value(
            &mut dict,
            "TimeUpdates",
            Value::from(properties.time_updates.as_str()),
        );
        super::insert_value(&mut dict, "Timezone", Value::from(properties.timezone));
        super::insert_value(
            &mut dict,
            "TimezoneUpdates",
            Value::from(properties.timezone_updates.as_str()),
        );
        super::insert_value(
            &mut dict,
            "Timeservers",
            Value::from(properties.timeservers),
        );

        dict
    }

    async fn set_property(&self, name: &str, value: Value<'_>) -> Result<(), BusError> {
        match name {
            "Time" => {
                let seconds = u64::try_from(&value)
                    .map_err(|_| BusError::InvalidArguments("Time wants uint64".into()))?;
                self.clock.set_time(seconds).await.map_err(BusError::from)
            }
            "TimeUpdates" => {
                let mode = String::try_from(value)
                    .map_err(|_| BusError::InvalidArguments("TimeUpdates wants a string".into()))?;
                self.clock
                    .set_time_updates(TimeUpdates::from_str(&mode))
                    .await
                    .map_err(BusError::from)
            }
            "Timezone" => {
                let timezone = String::try_from(value)
                    .map_err(|_| BusError::InvalidArguments("Timezone wants a string".into()))?;
                self.clock
                    .set_timezone(&timezone)
                    .await
                    .map_err(BusError::from)
            }
            "TimezoneUpdates" => {
                let mode = String::try_from(value).map_err(|_| {
                    BusError::InvalidArguments("TimezoneUpdates wants a string".into())
                })?;
                self.clock
                    .set_timezone_updates(TimeUpdates::from_str(&mode))
                    .await
                    .map_err(BusError::from)
            }
            "Timeservers" => {
                let servers = Vec::<String>::try_from(value).map_err(|_| {
                    BusError::InvalidArguments("Timeservers wants a string array".into())
                })?;
                self.clock
                    .set_timeservers(servers)
                    .await
                    .map_err(BusError::from)
            }
            _ => Err(BusError::InvalidProperty(format!("property {}", name))),
        }
    }
}
