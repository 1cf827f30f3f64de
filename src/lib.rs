pub mod archive;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod dicom_sender;
pub mod error;
pub mod ids;
pub mod inference_client;
pub mod matcher;
pub mod run;
pub mod scp;
pub mod sop_classes;
