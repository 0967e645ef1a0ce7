//! The response envelope every route returns:
//! `{status, data?, message?, pagination?}`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            data: Some(data),
            message: None,
            pagination: None,
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            status: "success",
            data: Some(data),
            message: Some(message.into()),
            pagination: None,
        }
    }

    pub fn paginated(data: T, page: usize, per_page: usize, total: usize) -> Self {
        Self {
            status: "success",
            data: Some(data),
            message: None,
            pagination: Some(Pagination {
                page,
                per_page,
                total,
            }),
        }
    }
}
