//! Payload sources for the publishing worker

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Mutex;

/// Error type returned by producers
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Supplies the `data` object of each history event
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self) -> Result<Map<String, Value>, ProducerError>;
}

/// Synthetic random walk: every step adds a uniform value in `[-step/2, step/2)`
pub struct RandomWalk {
    field: String,
    step: f64,
    value: Mutex<f64>,
}

impl RandomWalk {
    pub fn new(field: impl Into<String>, start: f64, step: f64) -> Self {
        Self {
            field: field.into(),
            step,
            value: Mutex::new(start),
        }
    }

    /// Temperature-like walk starting at 20 degC with steps within +/-5
    pub fn temperature() -> Self {
        Self::new("value[degC]", 20.0, 10.0)
    }

    pub fn current(&self) -> f64 {
        *self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Producer for RandomWalk {
    async fn produce(&self) -> Result<Map<String, Value>, ProducerError> {
        let delta = (rand::thread_rng().gen::<f64>() - 0.5) * self.step;

        let value = {
            let mut value = self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *value += delta;
            *value
        };

        let number = serde_json::Number::from_f64(value)
            .ok_or_else(|| format!("random walk produced a non-finite value: {value}"))?;

        let mut data = Map::new();
        data.insert(self.field.clone(), Value::Number(number));
        Ok(data)
    }
}

/// Produces the same data object every time
pub struct FixedProducer {
    data: Map<String, Value>,
}

impl FixedProducer {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Build from a JSON object; any other value yields an empty object
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(data) => Self::new(data),
            _ => Self::new(Map::new()),
        }
    }
}

#[async_trait]
impl Producer for FixedProducer {
    async fn produce(&self) -> Result<Map<String, Value>, ProducerError> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_random_walk_stays_within_step() {
        let walk = RandomWalk::temperature();
        let mut previous = walk.current();

        for _ in 0..100 {
            let data = walk.produce().await.unwrap();
            let value = data["value[degC]"].as_f64().unwrap();
            assert!((value - previous).abs() <= 5.0);
            previous = value;
        }
    }

    #[tokio::test]
    async fn test_fixed_producer() {
        let producer = FixedProducer::from_json(json!({"value": 42}));
        let data = producer.produce().await.unwrap();
        assert_eq!(Value::Object(data), json!({"value": 42}));
    }
}
