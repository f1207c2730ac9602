//! Catalog of capability names users may grant, mapped to the provider's
//! scope URLs. Mirrors what the authorization flow offers; `scope_filter` on
//! the session store narrows any requested set against what was granted.

pub struct ScopeInfo {
    pub name: &'static str,
    pub url: &'static str,
    pub description: &'static str,
}

pub const AVAILABLE_SCOPES: &[ScopeInfo] = &[
    ScopeInfo {
        name: "drive",
        url: "https://www.googleapis.com/auth/drive",
        description: "Full access to Google Drive files and folders",
    },
    ScopeInfo {
        name: "gmail_readonly",
        url: "https://www.googleapis.com/auth/gmail.readonly",
        description: "Read-only access to Gmail",
    },
    ScopeInfo {
        name: "gmail_full",
        url: "https://www.googleapis.com/auth/gmail.modify",
        description: "Full access to Gmail (read, send, modify)",
    },
    ScopeInfo {
        name: "gmail_labels",
        url: "https://www.googleapis.com/auth/gmail.labels",
        description: "Manage Gmail labels",
    },
    ScopeInfo {
        name: "gmail_compose",
        url: "https://www.googleapis.com/auth/gmail.compose",
        description: "Compose Gmail messages",
    },
    ScopeInfo {
        name: "calendar_events",
        url: "https://www.googleapis.com/auth/calendar.events",
        description: "Manage calendar events",
    },
    ScopeInfo {
        name: "calendar_readonly",
        url: "https://www.googleapis.com/auth/calendar.readonly",
        description: "Read-only access to calendar",
    },
    ScopeInfo {
        name: "documents",
        url: "https://www.googleapis.com/auth/documents",
        description: "Access Google Docs",
    },
    ScopeInfo {
        name: "spreadsheets",
        url: "https://www.googleapis.com/auth/spreadsheets",
        description: "Access Google Sheets",
    },
    ScopeInfo {
        name: "spreadsheets_readonly",
        url: "https://www.googleapis.com/auth/spreadsheets.readonly",
        description: "Read-only access to Google Sheets",
    },
];

pub fn scope_url(name: &str) -> Option<&'static str> {
    AVAILABLE_SCOPES
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.url)
}

/// Map capability names to scope URLs, dropping unknown names.
pub fn urls_for(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter_map(|n| scope_url(n))
        .map(str::to_string)
        .collect()
}
