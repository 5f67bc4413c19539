#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod log;
pub mod util;
pub mod registers;
pub mod target;
pub mod cache;
pub mod vtable;
pub mod session;
pub mod marshal;
pub mod stack;
