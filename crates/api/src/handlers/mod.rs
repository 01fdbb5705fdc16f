pub mod codes;
pub mod health;
pub mod plugins;
pub mod tasks;
