pub mod file_io;

pub mod net;

#[cfg(test)]
mod utils_test;
