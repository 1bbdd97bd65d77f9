pub mod data_source;
pub mod execution;
pub mod fixture_source;
pub mod paper_broker;

pub use data_source::{DataSource, SourceRegistration};
pub use execution::{ExecutionSink, FillListener};
pub use fixture_source::{FixtureSource, FixtureSourceSpec, MarketFixture};
pub use paper_broker::PaperBroker;
