pub mod health;
pub mod ops;
pub mod signup;
pub mod tenant;
