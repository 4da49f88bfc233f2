/// Generation of physical identifiers (table and index names).
///
/// Storage engines bound identifier lengths (63 bytes on Postgres), so index
/// names embed a fixed-width content hash instead of the full field list. The
/// hash input sorts the field names, making the result independent of the
/// declaration order and stable across re-synthesis.
use rand::Rng;
use sha2::{Digest, Sha256};

/// Width of the hash suffix embedded in index names.
const HASH_SUFFIX_LEN: usize = 12;
/// Length the table-name stem is truncated to inside index names.
const TABLE_STEM_LEN: usize = 12;
/// Random suffix appended to physical table names for collision avoidance.
const TABLE_SUFFIX_LEN: usize = 8;

pub fn make_index_name(table_name: &str, index_kind: &str, fields: &[&str]) -> String {
    let mut sorted = fields.to_vec();
    sorted.sort_unstable();
    let digest = Sha256::digest(
        format!("{} {} {}", table_name, index_kind, sorted.join(", ")).as_bytes(),
    );
    let hash = hex::encode(digest);

    let stem: String = table_name
        .replace("data_", "")
        .replace('-', "")
        .chars()
        .take(TABLE_STEM_LEN)
        .collect();
    let kind_initial = index_kind.chars().next().unwrap_or('x');

    format!(
        "idx_{}_{}{}",
        stem,
        kind_initial,
        &hash[hash.len() - HASH_SUFFIX_LEN..]
    )
}

/// Allocate a fresh physical table name for a new generation. The random
/// suffix is advisory collision avoidance, not verified unique before use;
/// the UNIQUE constraint on the generation record catches the (cosmically
/// unlikely) clash.
pub fn physical_table_name(dataset_slug: &str, table_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(rand::distributions::Alphanumeric)
        .map(char::from)
        .filter(char::is_ascii_lowercase)
        .take(TABLE_SUFFIX_LEN)
        .collect();

    format!(
        "data_{}_{}_{}",
        dataset_slug.replace('-', ""),
        table_name.replace('_', ""),
        suffix
    )
}

/// Double-quote an identifier for interpolation into generated DDL/DML.
/// Identifiers here are always produced by this module or vetted against the
/// synthesized column set, so stripping embedded quotes is enough.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_field_order_does_not_matter() {
        let a = make_index_name("data_mydata_table_abcdefgh", "order", &["name", "date"]);
        let b = make_index_name("data_mydata_table_abcdefgh", "order", &["date", "name"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_index_name_is_deterministic_and_distinct() {
        let base = make_index_name("data_mydata_table_abcdefgh", "filter", &["uf"]);
        assert_eq!(
            base,
            make_index_name("data_mydata_table_abcdefgh", "filter", &["uf"])
        );
        assert_ne!(
            base,
            make_index_name("data_mydata_table_abcdefgh", "filter", &["year"])
        );
        assert_ne!(
            base,
            make_index_name("data_mydata_table_abcdefgh", "order", &["uf"])
        );
        assert_ne!(
            base,
            make_index_name("data_otherdata_table_abcdefgh", "filter", &["uf"])
        );
    }

    #[test]
    fn test_index_name_shape() {
        let name = make_index_name(
            "data_some-very-long-dataset_tablename_abcdefgh",
            "search",
            &["search_data"],
        );
        assert!(name.starts_with("idx_"));
        assert!(name.contains("_s"));
        assert!(name.len() <= 4 + TABLE_STEM_LEN + 2 + HASH_SUFFIX_LEN);
    }

    #[test]
    fn test_physical_table_name() {
        let name = physical_table_name("socios-brasil", "empresa_socia");
        assert!(name.starts_with("data_sociosbrasil_empresasocia_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), TABLE_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));

        // Advisory uniqueness: two allocations should not collide
        assert_ne!(name, physical_table_name("socios-brasil", "empresa_socia"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("na\"me"), "\"name\"");
    }
}
