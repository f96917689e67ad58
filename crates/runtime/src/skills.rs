//! Workspace-backed skill registry.
//!
//! Skills are directories under `<workspace>/skills/<name>/` holding a
//! `SKILL.md` with a description line and free-form instructions. The
//! registry feeds the context assembler (compact index) and the
//! orchestrator's skill lifecycle (create / suggest-or-create).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use osa_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;

/// Matches at or above this relevance short-circuit skill creation.
pub const RELEVANCE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct SkillRecord {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub tools: Vec<String>,
    pub path: PathBuf,
}

pub struct SkillRegistry {
    dir: PathBuf,
    skills: RwLock<HashMap<String, SkillRecord>>,
}

impl SkillRegistry {
    /// Scan the skills directory. Missing directory = empty registry.
    pub fn load(dir: &Path) -> Self {
        let registry = Self {
            dir: dir.to_path_buf(),
            skills: RwLock::new(HashMap::new()),
        };
        registry.reload();
        registry
    }

    /// Re-scan the directory, replacing the in-memory set.
    pub fn reload(&self) {
        let mut skills = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            *self.skills.write() = skills;
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let doc = path.join("SKILL.md");
            let Ok(raw) = std::fs::read_to_string(&doc) else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let record = parse_skill(&name, &raw, &doc);
            skills.insert(name, record);
        }
        tracing::debug!(count = skills.len(), "skills loaded");
        *self.skills.write() = skills;
    }

    pub fn get(&self, name: &str) -> Option<SkillRecord> {
        self.skills.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<SkillRecord> {
        let mut out: Vec<SkillRecord> = self.skills.read().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.skills.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.read().is_empty()
    }

    /// Compact `name: description` index for the system prompt.
    pub fn render_index(&self) -> String {
        let skills = self.list();
        if skills.is_empty() {
            return String::new();
        }
        let mut out = String::from("Available skills:\n");
        for skill in skills {
            out.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
        out.trim_end().to_string()
    }

    /// Write a new skill definition and register it.
    pub fn create_skill(
        &self,
        name: &str,
        description: &str,
        instructions: &str,
        tools: &[String],
    ) -> Result<SkillRecord> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(Error::Other("skill name must contain letters or digits".into()));
        }
        if self.skills.read().contains_key(&slug) {
            return Err(Error::Other(format!("skill '{slug}' already exists")));
        }

        let skill_dir = self.dir.join(&slug);
        std::fs::create_dir_all(&skill_dir).map_err(Error::Io)?;
        let doc_path = skill_dir.join("SKILL.md");

        let tools_line = if tools.is_empty() {
            String::new()
        } else {
            format!("\nTools: {}\n", tools.join(", "))
        };
        let doc = format!("# {name}\n\n> {description}\n{tools_line}\n{instructions}\n");
        std::fs::write(&doc_path, doc).map_err(Error::Io)?;

        let record = SkillRecord {
            name: slug.clone(),
            description: description.to_string(),
            instructions: instructions.to_string(),
            tools: tools.to_vec(),
            path: doc_path,
        };
        self.skills.write().insert(slug, record.clone());
        Ok(record)
    }

    /// Keyword-overlap relevance of a query against a skill, in `[0, 1]`.
    pub fn relevance(query: &str, skill: &SkillRecord) -> f32 {
        let query_words = keywords(query);
        if query_words.is_empty() {
            return 0.0;
        }
        let haystack = format!("{} {}", skill.name.replace('-', " "), skill.description);
        let skill_words = keywords(&haystack);
        let hits = query_words
            .iter()
            .filter(|w| skill_words.contains(*w))
            .count();
        hits as f32 / query_words.len() as f32
    }

    /// Existing skills relevant to a proposed one, best first.
    pub fn suggest(&self, name: &str, description: &str) -> Vec<(SkillRecord, f32)> {
        let query = format!("{} {}", name.replace('-', " "), description);
        let mut scored: Vec<(SkillRecord, f32)> = self
            .list()
            .into_iter()
            .map(|s| {
                let score = Self::relevance(&query, &s);
                (s, score)
            })
            .filter(|(_, score)| *score >= RELEVANCE_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

fn parse_skill(name: &str, raw: &str, path: &Path) -> SkillRecord {
    let description = raw
        .lines()
        .find_map(|l| l.strip_prefix("> "))
        .unwrap_or("")
        .trim()
        .to_string();
    let tools = raw
        .lines()
        .find_map(|l| l.strip_prefix("Tools: "))
        .map(|l| l.split(',').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();
    SkillRecord {
        name: name.to_string(),
        description,
        instructions: raw.to_string(),
        tools,
        path: path.to_path_buf(),
    }
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn keywords(text: &str) -> Vec<String> {
    let mut words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(String::from)
        .collect();
    words.sort();
    words.dedup();
    words
}
