pub mod auth;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod decision;
pub mod keypoints;
pub mod live;
pub mod model_download;
pub mod pipeline;
pub mod sequence;
pub mod server;
pub mod service;
pub mod session;
pub mod types;
