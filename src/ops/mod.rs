pub mod adjustments;
pub mod crop;
pub mod generate;
pub mod mask;
pub mod scripting;
