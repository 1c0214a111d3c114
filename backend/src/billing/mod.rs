pub mod api;
pub mod service;

pub use api::routes;
pub use service::{
    create_invoice, find_invoice, get_invoice_status, list_invoices_for_patient,
    update_invoice_status,
};
