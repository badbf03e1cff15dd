// Collaborator bindings for real deployments

mod http;

pub use http::{
    HttpPreviewDeployer, HttpSandbox, HttpSelfHealer, HttpSubjectDirectory,
    DEPLOYMENT_POLL_INTERVAL,
};
