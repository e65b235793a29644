// Row selection in the backend's REST filter dialect
// `?select=*&supplier_id=eq.abc&order=created_at.desc&limit=10`

/// Sort direction for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// Filters, ordering and limits for a single select request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    columns: Option<String>,
    eq: Vec<(String, String)>,
    any_ilike: Option<(Vec<String>, String)>,
    order: Option<(String, Order)>,
    limit: Option<usize>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the returned columns (defaults to `*`)
    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    /// `column = value`
    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.eq.push((column.to_string(), value.into()));
        self
    }

    /// Case-insensitive substring match on any of `columns`
    ///
    /// A term that is blank once sanitized adds no filter, since every row
    /// contains the empty string.
    pub fn search(mut self, columns: &[&str], term: &str) -> Self {
        let term = sanitize_term(term);
        self.any_ilike = if term.is_empty() {
            None
        } else {
            Some((columns.iter().map(|c| c.to_string()).collect(), term))
        };
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Equality filters, in insertion order
    pub fn eq_filters(&self) -> &[(String, String)] {
        &self.eq
    }

    /// Columns and sanitized term of the substring filter
    pub fn search_filter(&self) -> Option<(&[String], &str)> {
        self.any_ilike
            .as_ref()
            .map(|(cols, term)| (cols.as_slice(), term.as_str()))
    }

    pub fn ordering(&self) -> Option<(&str, Order)> {
        self.order.as_ref().map(|(c, o)| (c.as_str(), *o))
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Render as query-string pairs
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];

        for (column, value) in &self.eq {
            params.push((column.clone(), format!("eq.{}", value)));
        }

        if let Some((columns, term)) = &self.any_ilike {
            let clauses: Vec<String> = columns
                .iter()
                .map(|c| format!("{}.ilike.*{}*", c, escape_like(term)))
                .collect();
            params.push(("or".to_string(), format!("({})", clauses.join(","))));
        }

        if let Some((column, order)) = &self.order {
            params.push(("order".to_string(), format!("{}.{}", column, order.as_str())));
        }

        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        params
    }
}

/// Strip characters that would break out of an `or=(...)` filter
fn sanitize_term(term: &str) -> String {
    term.chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '"' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// `_` is a single-character wildcard in `ilike`; match it literally
fn escape_like(term: &str) -> String {
    term.replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_default_selects_everything() {
        let params = SelectQuery::new().to_params();
        assert_eq!(params, vec![("select".to_string(), "*".to_string())]);
    }

    #[test]
    fn test_filters_and_order() {
        let params = SelectQuery::new()
            .eq("supplier_id", "s-1")
            .order("created_at", Order::Desc)
            .limit(1)
            .to_params();

        assert_eq!(param(&params, "supplier_id"), Some("eq.s-1"));
        assert_eq!(param(&params, "order"), Some("created_at.desc"));
        assert_eq!(param(&params, "limit"), Some("1"));
    }

    #[test]
    fn test_search_spans_both_columns() {
        let params = SelectQuery::new()
            .search(&["name", "description"], "cable")
            .to_params();

        assert_eq!(
            param(&params, "or"),
            Some("(name.ilike.*cable*,description.ilike.*cable*)")
        );
    }

    #[test]
    fn test_search_term_is_sanitized() {
        let query = SelectQuery::new().search(&["name"], " usb-c (braided), 2m* ");
        let (_, term) = query.search_filter().unwrap();
        assert_eq!(term, "usb-c braided 2m");
    }

    #[test]
    fn test_underscore_is_matched_literally() {
        let params = SelectQuery::new().search(&["name"], "usb_c").to_params();
        assert_eq!(param(&params, "or"), Some(r"(name.ilike.*usb\_c*)"));
    }

    #[test]
    fn test_blank_search_term_adds_no_filter() {
        let query = SelectQuery::new().search(&["name", "description"], " (*) ");
        assert_eq!(query.search_filter(), None);
        assert_eq!(param(&query.to_params(), "or"), None);
    }
}
