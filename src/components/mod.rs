pub mod commands;
pub mod history;
pub mod layers;
pub mod tools;
