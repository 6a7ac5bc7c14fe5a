//! Best-effort extraction of table names from DDL statement text.
//!
//! Used by the event filter to decide whether a query event touches only
//! configured tables. Names containing a literal dot cannot be split
//! reliably, so a dotted name is taken as already qualified; this is a
//! filter, not a security boundary.

/// Extract the referenced table names from a statement, qualifying
/// unqualified names with the statement's default database.
pub fn extract_table_names(statement: &str, default_db: &str) -> Vec<String> {
    let words = tokenize(statement);
    let is_rename = words
        .first()
        .map(|w| w.eq_ignore_ascii_case("RENAME"))
        .unwrap_or(false);

    let mut tables = Vec::new();
    let mut iter = words.iter().enumerate().peekable();

    while let Some((idx, word)) = iter.next() {
        let keyword = word.to_ascii_uppercase();
        let introduces_table = matches!(keyword.as_str(), "TABLE" | "INTO" | "FROM" | "JOIN")
            || (is_rename && idx > 0 && keyword == "TO");

        if !introduces_table {
            continue;
        }

        // Skip IF [NOT] EXISTS between the keyword and the name
        while let Some((_, next)) = iter.peek() {
            if matches!(
                next.to_ascii_uppercase().as_str(),
                "IF" | "NOT" | "EXISTS"
            ) {
                iter.next();
            } else {
                break;
            }
        }

        if let Some((_, name)) = iter.next() {
            if let Some(table) = qualify(name, default_db) {
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
        }
    }

    tables
}

/// Split a statement into words, keeping dots and backticks attached so
/// `db.tbl` and `` `db`.`tbl` `` survive as single tokens.
fn tokenize(statement: &str) -> Vec<String> {
    statement
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | ';' | '='))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn qualify(raw: &str, default_db: &str) -> Option<String> {
    let name = raw.replace('`', "");
    if name.is_empty() || !name.chars().next().is_some_and(is_identifier_start) {
        return None;
    }

    // A dotted name may itself contain a literal dot; it is taken as
    // already qualified.
    if name.contains('.') {
        Some(name)
    } else if default_db.is_empty() {
        Some(name)
    } else {
        Some(format!("{default_db}.{name}"))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_is_qualified_with_default_db() {
        assert_eq!(
            extract_table_names("CREATE TABLE orders (id INT)", "shop"),
            vec!["shop.orders"]
        );
    }

    #[test]
    fn alter_table_with_qualified_name() {
        assert_eq!(
            extract_table_names("ALTER TABLE shop.orders ADD COLUMN note TEXT", "other"),
            vec!["shop.orders"]
        );
    }

    #[test]
    fn drop_table_skips_if_exists() {
        assert_eq!(
            extract_table_names("DROP TABLE IF EXISTS old_data", "shop"),
            vec!["shop.old_data"]
        );
    }

    #[test]
    fn backticked_names_are_unquoted() {
        assert_eq!(
            extract_table_names("ALTER TABLE `shop`.`orders` DROP COLUMN note", ""),
            vec!["shop.orders"]
        );
    }

    #[test]
    fn rename_table_includes_both_names() {
        assert_eq!(
            extract_table_names("RENAME TABLE a TO b", "db"),
            vec!["db.a", "db.b"]
        );
    }

    #[test]
    fn insert_select_references_both_tables() {
        assert_eq!(
            extract_table_names("INSERT INTO target SELECT * FROM source", "db"),
            vec!["db.target", "db.source"]
        );
    }

    #[test]
    fn statement_without_tables_is_empty() {
        assert!(extract_table_names("BEGIN", "db").is_empty());
        assert!(extract_table_names("SET autocommit=1", "db").is_empty());
    }

    #[test]
    fn unqualified_name_without_default_db_stays_bare() {
        assert_eq!(extract_table_names("DROP TABLE t1", ""), vec!["t1"]);
    }
}
