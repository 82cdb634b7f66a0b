pub mod asic;
pub mod array;
pub mod byte;
pub mod config;
pub mod error;
pub mod event_queue;
pub mod fifo;
pub mod result;
