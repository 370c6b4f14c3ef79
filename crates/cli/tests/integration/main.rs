//! Integration tests for the kiln CLI.

mod common;

mod build_tests;
mod plan_tests;
