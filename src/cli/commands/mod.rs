pub mod train;

pub use train::TrainLoraArgs;
