pub mod archive;
pub mod calendar;
pub mod config;
pub mod database;
pub mod error;
pub mod mail;
pub mod platform;
pub mod report;
pub mod run;
pub mod source;
pub mod target;
pub mod thinning;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
