//! API request and response models.

pub mod requests;
