pub mod admin;
pub mod cloud;
pub mod controller;
pub mod gatehouse;
pub mod modelmanager;
pub mod pinger;
pub mod summarywatcher;
pub mod usermanager;
