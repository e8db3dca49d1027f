use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::AddressComponents;
use crate::errors::{AppError, AppResult};

const NUMBER_MARKER: &str = "#";
const SEGMENT_BREAK: &str = ",";
/// Spelled-out floor ordinals that belong to the unit that follows them.
const ORDINAL_WORDS: [&str; 7] = [
    "PRIMER", "PRIMERO", "SEGUNDO", "TERCER", "TERCERO", "CUARTO", "QUINTO",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStyle {
    #[default]
    Title,
    Upper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteEntry {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbbreviationEntry {
    pub token: String,
    pub canonical: String,
}

/// Serializable form of a rule set, as stored in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetFile {
    #[serde(default)]
    pub case_style: CaseStyle,
    pub rules: Vec<RewriteEntry>,
    pub abbreviations: Vec<AbbreviationEntry>,
    pub street_types: Vec<String>,
    /// Street types dropped when another street type follows them.
    #[serde(default)]
    pub yielding_street_types: Vec<String>,
    pub unit_markers: Vec<String>,
    #[serde(default)]
    pub connectors: Vec<String>,
}

/// Compiled, immutable rule set shared by every normalization.
#[derive(Debug)]
pub struct RuleSet {
    case_style: CaseStyle,
    rules: Vec<(Regex, String)>,
    abbreviations: HashMap<String, Vec<String>>,
    street_types: HashSet<String>,
    yielding_street_types: HashSet<String>,
    unit_markers: HashSet<String>,
    connectors: HashSet<String>,
    house_number: Regex,
    ordinal: Regex,
}

impl RuleSet {
    pub fn compile(file: RuleSetFile) -> AppResult<Self> {
        let rules = file
            .rules
            .iter()
            .map(|rule| Ok((Regex::new(&rule.pattern)?, rule.replacement.clone())))
            .collect::<AppResult<Vec<_>>>()?;

        let mut abbreviations: HashMap<String, Vec<String>> = HashMap::new();
        for entry in &file.abbreviations {
            let key = entry.token.trim().to_uppercase();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(AppError::Config(format!(
                    "abbreviation key must be a single token: {:?}",
                    entry.token
                )));
            }
            let canonical: Vec<String> = entry
                .canonical
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if canonical.is_empty() {
                return Err(AppError::Config(format!(
                    "abbreviation {:?} has an empty expansion",
                    entry.token
                )));
            }
            abbreviations.entry(key).or_insert(canonical);
        }

        for (key, canonical) in &abbreviations {
            if let Some(token) = canonical
                .iter()
                .find(|token| abbreviations.contains_key(&token.to_uppercase()))
            {
                return Err(AppError::Config(format!(
                    "expansion of {key} contains {token}, which is itself an abbreviation"
                )));
            }
        }

        Ok(Self {
            case_style: file.case_style,
            rules,
            abbreviations,
            street_types: upper_set(&file.street_types),
            yielding_street_types: upper_set(&file.yielding_street_types),
            unit_markers: upper_set(&file.unit_markers),
            connectors: file
                .connectors
                .iter()
                .map(|word| word.to_lowercase())
                .collect(),
            house_number: Regex::new(r"^\d+[A-Za-z]?-\d+[A-Za-z]?$")?,
            ordinal: Regex::new(r"(?i)^\d+(?:er|ro|do|to|vo|no|mo)$")?,
        })
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path)?;
        let file: RuleSetFile = serde_json::from_str(&contents)?;
        debug!(path = %path.display(), rules = file.rules.len(), "loaded normalization rule set");
        Self::compile(file)
    }

    pub fn colombian() -> AppResult<Self> {
        Self::compile(colombian_rules())
    }

    fn rewrite(&self, text: &str) -> String {
        self.rules
            .iter()
            .fold(text.to_string(), |acc, (pattern, replacement)| {
                pattern.replace_all(&acc, replacement.as_str()).into_owned()
            })
    }

    fn expand(&self, tokens: Vec<String>) -> Vec<String> {
        tokens
            .into_iter()
            .flat_map(|token| match self.abbreviations.get(&token.to_uppercase()) {
                Some(canonical) => canonical.clone(),
                None => vec![token],
            })
            .collect()
    }

    fn is_street_type(&self, token: &str) -> bool {
        self.street_types.contains(&token.to_uppercase())
    }

    fn is_unit_marker(&self, token: &str) -> bool {
        self.unit_markers.contains(&token.to_uppercase())
    }

    fn restructure(&self, tokens: Vec<String>) -> Vec<Vec<String>> {
        let mut segments: Vec<Vec<String>> = tokens
            .split(|token| token == SEGMENT_BREAK)
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.to_vec())
            .collect();
        for segment in &mut segments {
            self.drop_yielding_street_types(segment);
        }

        let located: Vec<(usize, usize)> = segments
            .iter()
            .enumerate()
            .flat_map(|(seg_idx, segment)| {
                segment
                    .iter()
                    .enumerate()
                    .filter(|(_, token)| self.is_street_type(token))
                    .map(move |(tok_idx, _)| (seg_idx, tok_idx))
            })
            .collect();

        // Reordering is only safe with a single unambiguous street type.
        let &[(seg_idx, type_idx)] = located.as_slice() else {
            return segments;
        };
        let street = segments.remove(seg_idx);
        segments.insert(0, self.reorder_street(street, type_idx));
        segments
    }

    fn drop_yielding_street_types(&self, segment: &mut Vec<String>) {
        if segment.len() < 2 {
            return;
        }
        for idx in (0..segment.len() - 1).rev() {
            let yields = self
                .yielding_street_types
                .contains(&segment[idx].to_uppercase());
            if yields && self.is_street_type(&segment[idx + 1]) {
                segment.remove(idx);
            }
        }
    }

    fn reorder_street(&self, segment: Vec<String>, type_idx: usize) -> Vec<String> {
        let mut ordered = if type_idx == 0 {
            segment
        } else if self.is_unit_run(&segment[..type_idx]) {
            let mut moved = segment[type_idx..].to_vec();
            moved.extend_from_slice(&segment[..type_idx]);
            moved
        } else {
            return segment;
        };
        self.insert_number_marker(&mut ordered);
        ordered
    }

    fn is_unit_run(&self, tokens: &[String]) -> bool {
        tokens.len() % 2 == 0
            && tokens.chunks(2).all(|pair| {
                self.is_unit_marker(&pair[0])
                    && !self.is_unit_marker(&pair[1])
                    && !self.is_street_type(&pair[1])
                    && pair[1] != NUMBER_MARKER
            })
    }

    fn insert_number_marker(&self, street: &mut Vec<String>) {
        if street.iter().any(|token| token == NUMBER_MARKER) {
            return;
        }
        let position = street
            .iter()
            .enumerate()
            .skip(2)
            .take_while(|(_, token)| !self.is_unit_marker(token))
            .find(|(_, token)| self.house_number.is_match(token))
            .map(|(idx, _)| idx);
        if let Some(idx) = position {
            street.insert(idx, NUMBER_MARKER.to_string());
        }
    }

    fn is_ordinal(&self, token: &str) -> bool {
        self.ordinal.is_match(token) || ORDINAL_WORDS.contains(&token.to_uppercase().as_str())
    }

    /// Splits normalized text: the street segment up to its first unit run,
    /// the unit run itself, then the next segment as neighborhood and
    /// anything after it as notes. Text that does not open with a street
    /// type is kept whole as notes.
    fn split_components(&self, normalized: &str) -> AddressComponents {
        let mut segments = normalized
            .split(SEGMENT_BREAK)
            .map(str::trim)
            .filter(|segment| !segment.is_empty());
        let Some(first) = segments.next() else {
            return AddressComponents::default();
        };
        let tokens: Vec<&str> = first.split_whitespace().collect();
        if !tokens.first().is_some_and(|token| self.is_street_type(token)) {
            return AddressComponents {
                notes: Some(normalized.trim().to_string()),
                ..AddressComponents::default()
            };
        }

        let mut unit_start = tokens
            .iter()
            .skip(1)
            .position(|token| self.is_unit_marker(token))
            .map_or(tokens.len(), |idx| idx + 1);
        if unit_start > 1 && unit_start < tokens.len() && self.is_ordinal(tokens[unit_start - 1]) {
            unit_start -= 1;
        }
        let rest: Vec<&str> = segments.collect();
        AddressComponents {
            street_info: Some(tokens[..unit_start].join(" ")),
            neighborhood: rest.first().map(|segment| segment.to_string()),
            apartment_info: (unit_start < tokens.len()).then(|| tokens[unit_start..].join(" ")),
            notes: (rest.len() > 1).then(|| rest[1..].join(", ")),
        }
    }

    fn case_token(&self, token: &str, segment_initial: bool) -> String {
        if token == NUMBER_MARKER {
            return token.to_string();
        }
        match self.case_style {
            CaseStyle::Upper => token.to_uppercase(),
            CaseStyle::Title if token.chars().any(|c| c.is_ascii_digit()) => {
                case_numeric_token(token)
            }
            CaseStyle::Title
                if !segment_initial && self.connectors.contains(&token.to_lowercase()) =>
            {
                token.to_lowercase()
            }
            CaseStyle::Title => title_case(token),
        }
    }

    fn assemble(&self, segments: Vec<Vec<String>>) -> String {
        segments
            .iter()
            .map(|segment| {
                segment
                    .iter()
                    .enumerate()
                    .map(|(idx, token)| self.case_token(token, idx == 0))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Deterministic address rewriter. Total: anything it does not recognise
/// only gets the generic cleanup.
#[derive(Clone, Debug)]
pub struct Normalizer {
    rules: Arc<RuleSet>,
}

impl Normalizer {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let collapsed = collapse_whitespace(raw);
        if collapsed.is_empty() {
            return String::new();
        }
        let rewritten = self.rules.rewrite(&collapsed);
        let tokens = tokenize(&strip_noise(&rewritten));
        let segments = self.rules.restructure(self.rules.expand(tokens));
        self.rules.assemble(segments)
    }

    /// Structured view of text this normalizer produced.
    pub fn components(&self, normalized: &str) -> AddressComponents {
        self.rules.split_components(normalized)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_noise(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '.' | '\'' | '´' | '`'))
        .map(|c| {
            if c.is_alphanumeric()
                || c.is_whitespace()
                || is_combining_mark(c)
                || matches!(c, '#' | '-' | '/' | ',')
            {
                c
            } else {
                ' '
            }
        })
        .collect()
}

/// Lower-casing can emit combining marks (`İ` -> `i\u{307}`); they must
/// survive a second pass.
fn is_combining_mark(c: char) -> bool {
    matches!(
        c,
        '\u{0300}'..='\u{036F}'
            | '\u{1AB0}'..='\u{1AFF}'
            | '\u{1DC0}'..='\u{1DFF}'
            | '\u{20D0}'..='\u{20FF}'
            | '\u{FE20}'..='\u{FE2F}'
    )
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c| c == '-' || c == '/'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// `72a` -> `72A`, `b-06` -> `B-06`, but `2do` stays lower case.
fn case_numeric_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let mut cased = String::with_capacity(token.len());
    let mut idx = 0;
    while idx < chars.len() {
        if !chars[idx].is_alphabetic() {
            cased.push(chars[idx]);
            idx += 1;
            continue;
        }
        let end = chars[idx..]
            .iter()
            .position(|c| !c.is_alphabetic())
            .map_or(chars.len(), |offset| idx + offset);
        let run: String = chars[idx..end].iter().collect();
        if end - idx == 1 {
            cased.push_str(&run.to_uppercase());
        } else {
            cased.push_str(&run.to_lowercase());
        }
        idx = end;
    }
    cased
}

fn upper_set(values: &[String]) -> HashSet<String> {
    values.iter().map(|value| value.to_uppercase()).collect()
}

fn colombian_rules() -> RuleSetFile {
    let rules = [
        (r"(?i)\bn[°º]\s*", " # "),
        (r"(?i)\b(?:no|nro|num)\.?\s*(\d)", " # $1"),
        (r"\s*#\s*", " # "),
        (
            r"(?i)\b(cra|cr|kra|kr|carrera|cll|cl|calle|av|ak|ac|avenida|dg|diagonal|tv|tr|transversal)\.?(\d)",
            "$1 $2",
        ),
        (r"\s*-\s*", "-"),
        (r"\s*,\s*", " , "),
    ];
    let abbreviations = [
        ("CRA", "Carrera"),
        ("CR", "Carrera"),
        ("KRA", "Carrera"),
        ("KR", "Carrera"),
        ("CRR", "Carrera"),
        ("CARR", "Carrera"),
        ("CL", "Calle"),
        ("CLL", "Calle"),
        ("CALL", "Calle"),
        ("AV", "Avenida"),
        ("AVE", "Avenida"),
        ("AVD", "Avenida"),
        ("AVDA", "Avenida"),
        ("AK", "Avenida Carrera"),
        ("AC", "Avenida Calle"),
        ("DG", "Diagonal"),
        ("DIAG", "Diagonal"),
        ("TV", "Transversal"),
        ("TR", "Transversal"),
        ("TRV", "Transversal"),
        ("TRANSV", "Transversal"),
        ("CQ", "Circular"),
        ("CRV", "Circunvalar"),
        ("AUT", "Autopista"),
        ("AUTOP", "Autopista"),
        ("APTO", "Apartamento"),
        ("APT", "Apartamento"),
        ("AP", "Apartamento"),
        ("INT", "Interior"),
        ("OF", "Oficina"),
        ("OFC", "Oficina"),
        ("OFIC", "Oficina"),
        ("BL", "Bloque"),
        ("BLQ", "Bloque"),
        ("LC", "Local"),
        ("LOC", "Local"),
        ("MZ", "Manzana"),
        ("MZA", "Manzana"),
        ("ED", "Edificio"),
        ("EDIF", "Edificio"),
        ("BRR", "Barrio"),
    ];
    let street_types = [
        "Calle",
        "Carrera",
        "Avenida",
        "Diagonal",
        "Transversal",
        "Circular",
        "Circunvalar",
        "Autopista",
    ];
    let unit_markers = [
        "Apartamento",
        "Interior",
        "Torre",
        "Piso",
        "Oficina",
        "Bloque",
        "Local",
        "Casa",
        "Manzana",
        "Edificio",
    ];
    let connectors = ["de", "del", "la", "las", "los", "el", "y"];

    RuleSetFile {
        case_style: CaseStyle::Title,
        rules: rules
            .iter()
            .map(|(pattern, replacement)| RewriteEntry {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            })
            .collect(),
        abbreviations: abbreviations
            .iter()
            .map(|(token, canonical)| AbbreviationEntry {
                token: token.to_string(),
                canonical: canonical.to_string(),
            })
            .collect(),
        street_types: street_types.iter().map(|s| s.to_string()).collect(),
        yielding_street_types: vec!["Avenida".to_string()],
        unit_markers: unit_markers.iter().map(|s| s.to_string()).collect(),
        connectors: connectors.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(RuleSet::colombian().unwrap()))
    }

    const CORPUS: &[&str] = &[
        "Cra 7 # 45-10, Bogota",
        "Cra72a#113-21 2do piso",
        "Av. Calle 108 A # 77 B-06 Primer piso",
        "Carrera 30 CC calle 100 B-7 la aldea santo domingo Medellín",
        "av. carrera 44B calle 13-16",
        "Apto 301 Cra 7 # 45-10, Bogota",
        "Bogota, Cra 7 45-10",
        "  CL 45 No. 12 - 30 ,, Barrio la Floresta  ",
        "AK 68 N° 22-10 Int 4",
        "calle 10 sur # 5-20 (frente al parque)",
        "Transversal 5 Bis # 8-90 apto 1201 torre 2",
        "Avenida Avenida 68 # 1-2",
        "??? ...",
        "",
        "   ",
        "no tiene direccion",
        "Dg 15 # 10-5, Barrio de La Candelaria, Bogotá D.C.",
        "aİ calle",
        "İBAGUÉ Cra 3 # 12-40",
        "Cll 5 # 3-1 e\u{301}dificio ÑANDÚ",
    ];

    #[test]
    fn expands_the_reference_example() {
        assert_eq!(
            normalizer().normalize("Cra 7 # 45-10, Bogota"),
            "Carrera 7 # 45-10, Bogota"
        );
    }

    #[test]
    fn splits_glued_street_type_and_number() {
        assert_eq!(
            normalizer().normalize("Cra72a#113-21 2do piso"),
            "Carrera 72A # 113-21 2do Piso"
        );
    }

    #[test]
    fn avenida_yields_to_following_street_type() {
        assert_eq!(
            normalizer().normalize("av. carrera 44B calle 13-16"),
            "Carrera 44B Calle 13-16"
        );
        assert_eq!(
            normalizer().normalize("AK 68 N° 22-10 Int 4"),
            "Carrera 68 # 22-10 Interior 4"
        );
    }

    #[test]
    fn moves_street_segment_first_and_inserts_marker() {
        assert_eq!(
            normalizer().normalize("Bogota, Cra 7 45-10"),
            "Carrera 7 # 45-10, Bogota"
        );
    }

    #[test]
    fn moves_leading_unit_behind_house_number() {
        assert_eq!(
            normalizer().normalize("Apto 301 Cra 7 # 45-10, Bogota"),
            "Carrera 7 # 45-10 Apartamento 301, Bogota"
        );
    }

    #[test]
    fn leaves_ambiguous_order_alone() {
        let normalized = normalizer().normalize("Carrera 30 CC calle 100 B-7 la aldea");
        assert_eq!(normalized, "Carrera 30 Cc Calle 100 B-7 la Aldea");
    }

    #[test]
    fn strips_noise_and_empty_segments() {
        assert_eq!(
            normalizer().normalize("  CL 45 No. 12 - 30 ,, Barrio la Floresta  "),
            "Calle 45 # 12-30, Barrio la Floresta"
        );
    }

    #[test]
    fn number_words_only_become_markers_before_digits() {
        assert_eq!(normalizer().normalize("Calle 45 No 10-20"), "Calle 45 # 10-20");
        assert_eq!(normalizer().normalize("no tiene direccion"), "No Tiene Direccion");
    }

    #[test]
    fn blank_input_normalizes_to_empty() {
        assert_eq!(normalizer().normalize(""), "");
        assert_eq!(normalizer().normalize(" \t\n "), "");
        assert_eq!(normalizer().normalize("... ???"), "");
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let normalizer = normalizer();
        for raw in CORPUS {
            let once = normalizer.normalize(raw);
            let twice = normalizer.normalize(&once);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn splits_normalized_text_into_components() {
        let normalizer = normalizer();
        let components = |raw: &str| normalizer.components(&normalizer.normalize(raw));

        assert_eq!(
            components("Cra72a#113-21 2do piso"),
            AddressComponents {
                street_info: Some("Carrera 72A # 113-21".into()),
                apartment_info: Some("2do Piso".into()),
                ..AddressComponents::default()
            }
        );
        let candelaria = components("Dg 15 # 10-5, Barrio de La Candelaria, Bogotá D.C.");
        assert_eq!(candelaria.street_info.as_deref(), Some("Diagonal 15 # 10-5"));
        assert_eq!(
            candelaria.neighborhood.as_deref(),
            Some("Barrio de la Candelaria")
        );
        assert!(candelaria.notes.is_some_and(|notes| notes.starts_with("Bogotá")));
        assert_eq!(candelaria.apartment_info, None);
        assert_eq!(
            components("Apto 301 Cra 7 # 45-10, Bogota"),
            AddressComponents {
                street_info: Some("Carrera 7 # 45-10".into()),
                neighborhood: Some("Bogota".into()),
                apartment_info: Some("Apartamento 301".into()),
                notes: None,
            }
        );
        assert_eq!(
            components("no tiene direccion").notes.as_deref(),
            Some("No Tiene Direccion")
        );
        assert_eq!(normalizer.components(""), AddressComponents::default());
    }

    #[test]
    fn casing_that_emits_combining_marks_is_stable() {
        let normalizer = normalizer();
        let once = normalizer.normalize("aİ calle");
        assert_eq!(once, "Ai\u{307} Calle");
        assert_eq!(normalizer.normalize(&once), once);
    }

    #[test]
    fn upper_case_style_is_a_fixed_point() {
        let mut file = colombian_rules();
        file.case_style = CaseStyle::Upper;
        let normalizer = Normalizer::new(Arc::new(RuleSet::compile(file).unwrap()));
        assert_eq!(
            normalizer.normalize("Cra 7 # 45-10, Bogota"),
            "CARRERA 7 # 45-10, BOGOTA"
        );
        for raw in CORPUS {
            let once = normalizer.normalize(raw);
            assert_eq!(once, normalizer.normalize(&once), "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn first_dictionary_entry_wins() {
        let mut file = colombian_rules();
        file.abbreviations.push(AbbreviationEntry {
            token: "cra".into(),
            canonical: "Carretera".into(),
        });
        let normalizer = Normalizer::new(Arc::new(RuleSet::compile(file).unwrap()));
        assert_eq!(normalizer.normalize("cra 7"), "Carrera 7");
    }

    #[test]
    fn rejects_expansions_that_are_keys() {
        let mut file = colombian_rules();
        file.abbreviations.push(AbbreviationEntry {
            token: "CALLEJON".into(),
            canonical: "Cl".into(),
        });
        assert!(matches!(RuleSet::compile(file), Err(AppError::Config(_))));
    }

    #[test]
    fn loads_rule_set_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, serde_json::to_string(&colombian_rules()).unwrap()).unwrap();
        let normalizer = Normalizer::new(Arc::new(RuleSet::load(&path).unwrap()));
        assert_eq!(normalizer.normalize("cl 1 # 2-3"), "Calle 1 # 2-3");
    }
}
