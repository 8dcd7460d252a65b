use serde::{Deserialize, Serialize};

/// A company as it appears on a listing page, before its detail page is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyStub {
    pub name: String,
    pub source_url: String,
}

/// Fields recovered from a detail page. Either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub description: Option<String>,
    pub location: Option<String>,
}

/// One row of the `companies` table, minus the generated id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub name: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl CompanyRecord {
    pub fn from_stub(stub: CompanyStub, fields: DetailFields) -> Self {
        CompanyRecord {
            name: stub.name,
            source_url: stub.source_url,
            description: fields.description,
            location: fields.location,
        }
    }
}
