pub mod alerts;
pub mod api;
pub mod config;
pub mod distributor;
pub mod error;
pub mod facedetect;
pub mod gateway;
pub mod metrics;
pub mod supervisor;
