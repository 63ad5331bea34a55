//! Support code for the `usbhost` command line tool

pub mod config;
