/// MQTT client
pub mod mqtt;
