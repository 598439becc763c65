//! Shared test doubles.
//!
//! Compiled into unit tests and, behind the `test-utils` feature, into the
//! integration test binaries.

pub mod mocks;

pub use mocks::{
    MemoryStore, MockBroadcaster, MockConfig, MockConverter, MockFees, MockPayments, MockSigner,
    MockSubscriber, RecordingEvents,
};
