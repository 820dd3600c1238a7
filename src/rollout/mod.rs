pub mod ab;
pub mod blue_green;
pub mod canary;
