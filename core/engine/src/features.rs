use chrono::{DateTime, Utc};
use para_schemas::{feature, Category, FeatureSet, FeatureValue, NoteMetadata};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Notes untouched for longer than this count as stale.
pub const STALE_AFTER_DAYS: i64 = 180;

// Vocabulary is English + Spanish; every keyword belongs to one category.
const PROJECT_WORDS: &[&str] = &[
    "project", "proyecto", "sprint", "milestone", "hito", "deliverable", "entregable", "launch",
    "lanzamiento", "roadmap", "kickoff", "client", "cliente", "implement", "implementar",
    "release", "prototype", "prototipo", "mvp", "campaign", "campaña",
];

const AREA_WORDS: &[&str] = &[
    "health", "salud", "finance", "finanzas", "career", "carrera", "habit", "habits", "hábito",
    "hábitos", "habitos", "routine", "rutina", "fitness", "family", "familia", "home", "hogar",
    "personal development", "desarrollo personal", "growth", "crecimiento", "skills",
    "habilidades", "continuous improvement", "mejora continua", "budget", "presupuesto",
    "wellbeing", "bienestar",
];

const RESOURCE_WORDS: &[&str] = &[
    "guide", "guía", "guia", "tutorial", "reference", "referencia", "documentation",
    "documentación", "template", "plantilla", "recipe", "receta", "cheatsheet", "cheat sheet",
    "book", "libro", "article", "artículo", "how-to", "how to", "manual", "snippet", "course",
    "curso", "research", "investigación",
];

const ARCHIVE_WORDS: &[&str] = &[
    "completed", "completado", "finished", "terminado", "finalizado", "archived", "archivado",
    "obsolete", "obsoleto", "deprecated", "old", "antiguo", "legacy", "retired", "cancelled",
    "cancelado",
];

const URGENCY_MARKERS: &[&str] = &[
    "urgent", "urgente", "asap", "immediately", "inmediatamente", "critical", "crítico",
    "critico", "high priority", "alta prioridad", "overdue", "vencido", "blocker", "important",
    "importante",
];

const MAINTENANCE_MARKERS: &[&str] = &[
    "weekly", "semanal", "monthly", "mensual", "daily", "diario", "routine", "rutina", "ongoing",
    "continuo", "recurring", "recurrente", "maintain", "maintenance", "mantener",
    "mantenimiento", "review", "revisión", "standard", "estándar", "responsibility",
    "responsabilidad",
];

const REFERENCE_MARKERS: &[&str] = &[
    "reference", "referencia", "template", "plantilla", "guide", "guía", "documentation",
    "documentación", "how to", "how-to", "cheatsheet", "tutorial", "snippet", "example",
    "ejemplo",
];

const COMPLETION_MARKERS: &[&str] = &[
    "completed", "completado", "finished", "terminado", "finalizado", "done", "hecho",
    "obsolete", "obsoleto", "deprecated", "archived", "archivado", "no longer", "ya no",
    "cancelled", "cancelado",
];

const ACTIVE_MARKERS: &[&str] = &[
    "in progress", "en progreso", "en curso", "pending", "pendiente", "active", "activo",
    "current", "next step", "siguiente paso", "wip",
];

const ACTIVE_STATUSES: &[&str] = &[
    "active", "in progress", "in-progress", "doing", "ongoing", "wip", "pending", "todo",
    "backlog", "activo", "en curso", "en progreso", "pendiente",
];

const COMPLETED_STATUSES: &[&str] = &[
    "done", "completed", "complete", "finished", "closed", "archived", "cancelled", "completado",
    "terminado", "finalizado", "hecho", "cerrado", "archivado", "cancelado",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Active,
    Completed,
}

/// Classify a front-matter status value.
pub fn status_class(status: &str) -> Option<StatusClass> {
    let status = status.trim().to_lowercase();
    if ACTIVE_STATUSES.contains(&status.as_str()) {
        Some(StatusClass::Active)
    } else if COMPLETED_STATUSES.contains(&status.as_str()) {
        Some(StatusClass::Completed)
    } else {
        None
    }
}

fn pattern(src: &str) -> Regex {
    Regex::new(src).expect("hard-coded pattern compiles")
}

/// Case-insensitive whole-word alternation over a keyword list. Longer
/// phrases are tried first so "how to" wins over "how".
fn keyword_pattern(words: &[&str]) -> Regex {
    let mut sorted: Vec<&str> = words.to_vec();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    let alternation = sorted
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    pattern(&format!(r"(?i)\b(?:{})\b", alternation))
}

fn matches_of(regex: &Regex, lower: &str) -> BTreeSet<String> {
    regex.find_iter(lower).map(|m| m.as_str().to_string()).collect()
}

/// Fixed domain vocabulary mapping keywords to categories.
pub struct Vocabulary {
    matcher: Regex,
    lookup: HashMap<String, Category>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        let groups: [(Category, &[&str]); 4] = [
            (Category::Projects, PROJECT_WORDS),
            (Category::Areas, AREA_WORDS),
            (Category::Resources, RESOURCE_WORDS),
            (Category::Archive, ARCHIVE_WORDS),
        ];

        let mut lookup = HashMap::new();
        let mut all_words = Vec::new();
        for (category, words) in groups {
            for word in words {
                lookup.insert(word.to_string(), category);
                all_words.push(*word);
            }
        }

        Self {
            matcher: keyword_pattern(&all_words),
            lookup,
        }
    }

    pub fn category_of(&self, keyword: &str) -> Option<Category> {
        self.lookup.get(keyword).copied()
    }

    fn find(&self, lower: &str) -> BTreeSet<String> {
        matches_of(&self.matcher, lower)
    }
}

struct FrontMatter {
    status: Option<String>,
    tags: BTreeSet<String>,
}

/// Turns note text into a `FeatureSet`. Stateless after construction and
/// safe to share between threads.
pub struct FeatureExtractor {
    goal_patterns: Vec<Regex>,
    responsibility_patterns: Vec<Regex>,
    dashboard_patterns: Vec<Regex>,
    date_patterns: Vec<Regex>,
    deadline_patterns: Vec<Regex>,
    checklist_pattern: Regex,
    image_patterns: Vec<Regex>,
    table_separator: Regex,
    code_fence: Regex,
    link_patterns: Vec<Regex>,
    front_matter: Regex,
    clusters: Vec<(&'static str, Regex)>,
    task_marker: Regex,
    vocabulary: Vocabulary,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            goal_patterns: vec![
                pattern(r"(?i)\b(goals?|objectives?|okrs?|key results?|objetivos?|metas?|resultados? clave)\b"),
                pattern(r"(?im)^#+\s*(goal|objetivo|okr)"),
            ],
            responsibility_patterns: vec![
                pattern(r"(?i)\b(responsibilit(y|ies)|roles?|owner(ship)?|standards?|responsabilidad(es)?|rol|mantener)\b"),
            ],
            dashboard_patterns: vec![
                pattern(r"(?i)\b(dashboards?|reports?|kpis?|metrics|informes?|reportes?|tablero|panel de control)\b"),
                pattern(r"(?m)^\s*```\s*dataview"),
            ],
            date_patterns: vec![
                // ISO dates
                pattern(r"\b\d{4}-\d{2}-\d{2}\b"),
                // Day/month/year
                pattern(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b"),
                // Month-name dates
                pattern(r"(?i)\b(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sep(tember)?|oct(ober)?|nov(ember)?|dec(ember)?)\s+\d{1,2}(st|nd|rd|th)?\b"),
                pattern(r"(?i)\b\d{1,2}\s+(de\s+)?(enero|febrero|marzo|abril|mayo|junio|julio|agosto|septiembre|octubre|noviembre|diciembre)\b"),
            ],
            deadline_patterns: vec![
                // Relative quarters
                pattern(r"(?i)\b(q[1-4]|h[12])\b"),
                pattern(r"(?i)\b(next|this|end of)\s+(quarter|sprint|month)\b"),
                pattern(r"(?i)\b(pr[oó]ximo|este|fin de)\s+(trimestre|mes|sprint)\b"),
                // Deadline words
                pattern(r"(?i)\b(deadline|due( date)?|fecha l[ií]mite|plazo|vence|vencimiento|entrega)\b"),
            ],
            checklist_pattern: pattern(r"(?m)^\s*[-*+]\s+\[([ xX])\]"),
            image_patterns: vec![
                pattern(r"!\[[^\]]*\]\([^)]+\)"),
                pattern(r"(?i)!\[\[[^\]]+\.(png|jpe?g|gif|svg|webp)(\|[^\]]*)?\]\]"),
            ],
            table_separator: pattern(r"(?m)^\s*\|(\s*:?-+:?\s*\|)+\s*$"),
            code_fence: pattern(r"(?m)^\s*(```|~~~)"),
            link_patterns: vec![
                pattern(r"(?:^|[^!])\[\[[^\]\n]+\]\]"),
                pattern(r"(?:^|[^!])\[[^\]\n]+\]\([^)\s]+\)"),
            ],
            front_matter: pattern(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)"),
            clusters: vec![
                (feature::URGENCY_MARKERS, keyword_pattern(URGENCY_MARKERS)),
                (feature::MAINTENANCE_MARKERS, keyword_pattern(MAINTENANCE_MARKERS)),
                (feature::REFERENCE_MARKERS, keyword_pattern(REFERENCE_MARKERS)),
                (feature::COMPLETION_MARKERS, keyword_pattern(COMPLETION_MARKERS)),
                (feature::ACTIVE_MARKERS, keyword_pattern(ACTIVE_MARKERS)),
            ],
            // Task syntax only; lowercase "todo" is an ordinary Spanish word
            task_marker: pattern(r"\b(?:TODO|FIXME)\b"),
            vocabulary: Vocabulary::new(),
        }
    }

    /// Extract features, measuring note age against the current time.
    pub fn extract(&self, text: &str, metadata: &NoteMetadata) -> FeatureSet {
        self.extract_at(text, metadata, Utc::now())
    }

    /// Extract features with an explicit reference time. Never fails:
    /// malformed pieces degrade to defaults.
    pub fn extract_at(&self, text: &str, metadata: &NoteMetadata, now: DateTime<Utc>) -> FeatureSet {
        let lower = text.to_lowercase();

        let front_matter = match self.parse_front_matter(text) {
            Ok(fm) => fm,
            Err(e) => {
                debug!("Ignoring front matter: {}", e);
                None
            }
        };

        let (pending, completed) = self.count_tasks(text);
        let has_dates = any_match(&self.date_patterns, text);
        let has_deadline = has_dates || any_match(&self.deadline_patterns, text);

        let mut features = FeatureSet::new()
            .with(feature::HAS_GOAL, flag(any_match(&self.goal_patterns, text)))
            .with(
                feature::HAS_RESPONSIBILITY,
                flag(any_match(&self.responsibility_patterns, text)),
            )
            .with(feature::HAS_DASHBOARD, flag(any_match(&self.dashboard_patterns, text)))
            .with(feature::HAS_DEADLINE, flag(has_deadline))
            .with(feature::HAS_DATES, flag(has_dates))
            .with(feature::DOMAIN_KEYWORDS, FeatureValue::Set(self.vocabulary.find(&lower)))
            .with(feature::N_TASKS, FeatureValue::Count(pending + completed))
            .with(feature::N_PENDING, FeatureValue::Count(pending))
            .with(feature::N_COMPLETED, FeatureValue::Count(completed))
            .with(feature::HAS_IMAGES, flag(any_match(&self.image_patterns, text)))
            .with(feature::HAS_TABLES, flag(self.table_separator.is_match(text)))
            .with(feature::HAS_CODE, flag(self.code_fence.is_match(text)))
            .with(feature::N_LINKS, FeatureValue::Count(self.count_links(text)))
            .with(
                feature::WORD_COUNT,
                FeatureValue::Count(text.split_whitespace().count() as u64),
            )
            .with(feature::BYTE_SIZE, FeatureValue::Count(text.len() as u64));

        features = match front_matter {
            Some(fm) => features
                .with(
                    feature::STATUS,
                    fm.status.map(FeatureValue::Text).unwrap_or(FeatureValue::Null),
                )
                .with(feature::TAGS, FeatureValue::Set(fm.tags)),
            None => features
                .with(feature::STATUS, FeatureValue::Null)
                .with(feature::TAGS, FeatureValue::Set(BTreeSet::new())),
        };

        for (name, regex) in &self.clusters {
            let mut found = matches_of(regex, &lower);
            if *name == feature::ACTIVE_MARKERS {
                found.extend(self.task_marker.find_iter(text).map(|m| m.as_str().to_lowercase()));
            }
            features = features.with(name, FeatureValue::Set(found));
        }

        features = with_path_signals(features, metadata, now);

        debug!(
            "Extracted {} features ({} words, {} tasks)",
            features.len(),
            features.count(feature::WORD_COUNT),
            features.count(feature::N_TASKS)
        );

        features
    }

    fn count_tasks(&self, text: &str) -> (u64, u64) {
        let mut pending = 0;
        let mut completed = 0;
        for caps in self.checklist_pattern.captures_iter(text) {
            match caps.get(1).map(|m| m.as_str()) {
                Some(" ") => pending += 1,
                Some(_) => completed += 1,
                None => {}
            }
        }
        (pending, completed)
    }

    fn count_links(&self, text: &str) -> u64 {
        self.link_patterns
            .iter()
            .map(|p| p.find_iter(text).count() as u64)
            .sum()
    }

    /// Parse YAML front matter. Malformed YAML is an input error; the caller
    /// degrades to "no front matter".
    fn parse_front_matter(&self, text: &str) -> Result<Option<FrontMatter>> {
        let Some(caps) = self.front_matter.captures(text) else {
            return Ok(None);
        };
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        let value: serde_yaml::Value = serde_yaml::from_str(body)
            .map_err(|e| EngineError::Input(format!("front matter: {}", e)))?;
        let serde_yaml::Value::Mapping(map) = value else {
            return Err(EngineError::Input("front matter is not a mapping".into()));
        };

        let status = map
            .get("status")
            .and_then(scalar_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let tags = match map.get("tags") {
            Some(serde_yaml::Value::Sequence(items)) => {
                items.iter().filter_map(scalar_to_string).map(normalize_tag).collect()
            }
            Some(other) => scalar_to_string(other)
                .map(|s| s.split(',').map(normalize_tag).filter(|t| !t.is_empty()).collect())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        };

        Ok(Some(FrontMatter { status, tags }))
    }
}

fn flag(value: bool) -> FeatureValue {
    FeatureValue::Flag(value)
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_tag(tag: impl AsRef<str>) -> String {
    tag.as_ref().trim().trim_start_matches('#').to_lowercase()
}

fn with_path_signals(features: FeatureSet, metadata: &NoteMetadata, now: DateTime<Utc>) -> FeatureSet {
    let in_archive_path = metadata
        .path
        .as_ref()
        .map(|path| {
            path.components().any(|c| {
                let part = c.as_os_str().to_string_lossy().to_lowercase();
                part.contains("archiv") || part == "old"
            })
        })
        .unwrap_or(false);

    let days = metadata
        .modified
        .map(|modified| (now - modified).num_days().max(0) as u64);

    features
        .with(feature::IN_ARCHIVE_PATH, flag(in_archive_path))
        .with(
            feature::DAYS_SINCE_MODIFIED,
            days.map(FeatureValue::Count).unwrap_or(FeatureValue::Null),
        )
        .with(
            feature::IS_STALE,
            flag(days.map(|d| d as i64 > STALE_AFTER_DAYS).unwrap_or(false)),
        )
}
