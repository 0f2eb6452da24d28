pub mod admin;
pub mod fhir;
