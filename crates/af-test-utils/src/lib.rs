// af-test-utils: Shared test utilities for the fleet suite.
//
// Provides a scriptable mock device HTTP server for integration testing of
// the poller and preview services, and bearer-token helpers for hub tests.

pub mod mock_device;
pub mod tokens;

pub use mock_device::{DeviceFixture, MockDeviceServer};
pub use tokens::{mint_expired_token, mint_token, TEST_SIGNING_SECRET};
