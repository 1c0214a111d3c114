pub mod api;
pub mod service;

pub use api::routes;
pub use service::{
    decide_authorization, get_authorization, list_authorizations, submit_authorization,
};
