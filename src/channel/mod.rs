pub mod channel;
pub mod controller;
pub mod housekeeping;
pub mod init;
pub mod task;
