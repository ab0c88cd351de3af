pub mod completion;
pub mod proxy;
