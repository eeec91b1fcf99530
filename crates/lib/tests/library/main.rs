mod common;
mod hierarchy_tests;
mod job_tests;
mod remote_tests;
