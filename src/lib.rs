pub mod crypto;
pub mod error;
pub mod fram;
pub mod manager;
pub mod measurement;
pub mod pairing;
pub mod rxbuffer;
pub mod sensor;
pub mod store;
pub mod transport;

pub use error::SensorError;
pub use manager::{ConnectionState, ManagerConfig, SensorEvent, SensorManager};
pub use measurement::{Measurement, SensorData};
pub use store::{JsonStore, MemoryStore, SensorStore};
