pub mod operator;
pub mod tenant;
