pub mod fields;
pub mod links;
pub mod text;

pub use fields::extract_fields;
pub use links::{company_links, LinkRules};
