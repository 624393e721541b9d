pub mod block;
pub mod height;
