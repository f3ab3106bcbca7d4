//! CozoDB schema for the exported library

use super::StoreError;
use cozo::DbInstance;
use std::collections::HashSet;

pub const SCHEMA_VERSION: &str = "1";

fn get_existing_relations(db: &DbInstance) -> Result<HashSet<String>, StoreError> {
    let result = db
        .run_script("::relations", Default::default(), cozo::ScriptMutability::Immutable)
        .map_err(|e| StoreError::Schema(e.to_string()))?;

    // Columns are [name, arity, access_level, ...]
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(|v| v.get_str()).map(str::to_string))
        .collect())
}

/// Create all required relations (idempotent)
pub fn create_all_relations(db: &DbInstance) -> Result<(), StoreError> {
    let existing = get_existing_relations(db)?;
    log::debug!("Existing relations: {:?}", existing);

    let relations: [(&str, &str); 7] = [
        ("information", INFORMATION),
        ("tracks", TRACKS),
        ("beatgrids", BEATGRIDS),
        ("hot_cues", HOT_CUES),
        ("loops", LOOPS),
        ("crates", CRATES),
        ("crate_tracks", CRATE_TRACKS),
    ];

    for (name, script) in relations {
        if !existing.contains(name) {
            log::debug!("Creating '{}' relation", name);
            run_schema(db, script)?;
        }
    }

    if !existing.contains("information") {
        let mut params = std::collections::BTreeMap::new();
        params.insert("version".to_string(), cozo::DataValue::Str(SCHEMA_VERSION.into()));
        db.run_script(
            r#"
            ?[key, value] <- [['schema_version', $version]]
            :put information {key => value}
        "#,
            params,
            cozo::ScriptMutability::Mutable,
        )
        .map_err(|e| StoreError::Schema(e.to_string()))?;
    }

    Ok(())
}

fn run_schema(db: &DbInstance, script: &str) -> Result<(), StoreError> {
    db.run_script(script, Default::default(), cozo::ScriptMutability::Mutable)
        .map_err(|e| StoreError::Schema(e.to_string()))?;
    Ok(())
}

const INFORMATION: &str = r#"
    {:create information {
        key: String =>
        value: String
    }}
"#;

const TRACKS: &str = r#"
    {:create tracks {
        id: Int =>
        relative_path: String,
        filename: String,
        file_extension: String?,
        title: String?,
        artist: String?,
        album: String?,
        genre: String?,
        comment: String?,
        composer: String?,
        track_number: Int?,
        year: Int?,
        bpm: Float?,
        key: Int?,
        bitrate: Int?,
        sample_rate: Int?,
        sample_count: Int?,
        last_modified_ms: Int?,
        main_cue: Float?
    }}
"#;

const BEATGRIDS: &str = r#"
    {:create beatgrids {
        track_id: Int,
        marker: Int =>
        beat_index: Int,
        sample_offset: Float
    }}
"#;

const HOT_CUES: &str = r#"
    {:create hot_cues {
        track_id: Int,
        slot: Int =>
        label: String,
        sample_offset: Float,
        color: String
    }}
"#;

const LOOPS: &str = r#"
    {:create loops {
        track_id: Int,
        slot: Int =>
        start_sample: Float,
        end_sample: Float,
        label: String?
    }}
"#;

const CRATES: &str = r#"
    {:create crates {
        id: Int =>
        name: String,
        parent_id: Int?
    }}
"#;

const CRATE_TRACKS: &str = r#"
    {:create crate_tracks {
        crate_id: Int,
        track_id: Int
    }}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent() {
        let db = DbInstance::new("mem", "", "").unwrap();
        create_all_relations(&db).unwrap();
        create_all_relations(&db).unwrap();

        let existing = get_existing_relations(&db).unwrap();
        for name in ["information", "tracks", "beatgrids", "hot_cues", "loops", "crates", "crate_tracks"] {
            assert!(existing.contains(name), "missing relation {}", name);
        }
    }
}
