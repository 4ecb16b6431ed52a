pub mod support;

mod dispatch_tests;
mod sync_tests;
