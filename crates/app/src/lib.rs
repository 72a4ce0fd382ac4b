//! HTTP camera server library: the binary is a thin wrapper around
//! [`camera::run`].

pub mod camera;
