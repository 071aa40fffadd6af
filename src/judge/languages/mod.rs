pub mod java;
pub mod javascript;
pub mod native;
pub mod python;
pub mod ruby;
pub mod scripting;
