pub mod broker;
pub mod paper;
pub mod rest;

pub use broker::BrokerApi;
#[cfg(test)]
pub use broker::MockBrokerApi;
pub use paper::PaperBroker;
pub use rest::RestBroker;
