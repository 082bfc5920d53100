pub mod aspects;
pub mod assessments;
pub mod auth;
pub mod calc;
pub mod core;
pub mod criteria;
pub mod department_admins;
pub mod departments;
pub mod evaluators;
pub mod reports;
pub mod setup;
pub mod students;
