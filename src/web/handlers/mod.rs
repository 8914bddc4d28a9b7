pub mod appservice;
pub mod health;
