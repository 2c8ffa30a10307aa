mod util;
mod worker_tests;
