//! Scripted collaborators for exercising the SDK without a browser or a
//! reporting service.

pub mod mock_api;
pub mod mock_driver;

pub use mock_api::{InitializeCall, MockReportingApi, UploadedAttachment};
pub use mock_driver::MockDriver;
