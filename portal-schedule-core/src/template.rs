use std::{collections::HashMap, fmt, path::Path};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const BUILTIN_TEMPLATES: &str = include_str!("../templates/default.json");

/// 学部
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchoolLevel {
    /// 6-8 年级
    Middle,
    /// 9-12 年级
    Upper,
}

impl SchoolLevel {
    pub fn for_grade(grade: u8) -> Result<Self> {
        match grade {
            6..=8 => Ok(SchoolLevel::Middle),
            9..=12 => Ok(SchoolLevel::Upper),
            _ => Err(Error::UnsupportedSchoolLevel(grade)),
        }
    }
}

impl fmt::Display for SchoolLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchoolLevel::Middle => f.write_str("middle"),
            SchoolLevel::Upper => f.write_str("upper"),
        }
    }
}

/// 通用课表中的一个时段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBlock {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// 只对这些年级生效，缺省为全部年级
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grades: Option<Vec<u8>>,
}

impl TemplateBlock {
    pub fn applies_to(&self, grade: u8) -> bool {
        self.grades.as_ref().is_none_or(|grades| grades.contains(&grade))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey {
    pub level: SchoolLevel,
    pub rotation_day: u8,
    pub late_start: bool,
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} day {}{}",
            self.level,
            self.rotation_day,
            if self.late_start { " (late start)" } else { "" }
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateRecord {
    level: SchoolLevel,
    rotation_day: u8,
    late_start: bool,
    blocks: Vec<TemplateBlock>,
}

/// 进程内只读的通用课表集合
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<TemplateKey, Vec<TemplateBlock>>,
}

impl TemplateSet {
    /// 内置的默认课表
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_TEMPLATES)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|err| {
            Error::Config(format!(
                "Cannot read template file {}: {}",
                path_ref.display(),
                err
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<TemplateRecord> = serde_json::from_str(json)?;
        let mut templates = HashMap::new();

        for record in records {
            validate_rotation_day(record.rotation_day)?;
            let key = TemplateKey {
                level: record.level,
                rotation_day: record.rotation_day,
                late_start: record.late_start,
            };

            let mut blocks = record.blocks;
            blocks.sort_by_key(|block| block.start);
            validate_blocks(&key, &blocks)?;

            if templates.insert(key, blocks).is_some() {
                return Err(Error::Config(format!("Duplicate template for {}", key)));
            }
        }

        tracing::debug!("Loaded {} schedule templates", templates.len());
        Ok(Self { templates })
    }

    /// 某个年级某天适用的时段，按开始时间排序
    pub fn blocks_for(
        &self,
        grade: u8,
        rotation_day: u8,
        late_start: bool,
    ) -> Result<Vec<&TemplateBlock>> {
        let level = SchoolLevel::for_grade(grade)?;
        validate_rotation_day(rotation_day)?;
        let key = TemplateKey {
            level,
            rotation_day,
            late_start,
        };

        let blocks = self
            .templates
            .get(&key)
            .ok_or_else(|| Error::TemplateMissing(key.to_string()))?;
        Ok(blocks.iter().filter(|b| b.applies_to(grade)).collect())
    }

    pub fn keys(&self) -> Vec<TemplateKey> {
        let mut keys: Vec<_> = self.templates.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn validate_rotation_day(day: u8) -> Result<()> {
    if (1..=6).contains(&day) {
        Ok(())
    } else {
        Err(Error::InvalidRotationDay(day))
    }
}

fn validate_blocks(key: &TemplateKey, blocks: &[TemplateBlock]) -> Result<()> {
    for block in blocks {
        if block.start >= block.end {
            return Err(Error::Config(format!(
                "Block {} in {} ends before it starts",
                block.code, key
            )));
        }
    }

    // 年级限定的时段可以互相错开，这里只检查会同时生效的时段
    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            if b.start < a.end && shares_grade(a, b) {
                return Err(Error::Config(format!(
                    "Blocks {} and {} overlap in {}",
                    a.code, b.code, key
                )));
            }
        }
    }
    Ok(())
}

fn shares_grade(a: &TemplateBlock, b: &TemplateBlock) -> bool {
    match (&a.grades, &b.grades) {
        (Some(x), Some(y)) => x.iter().any(|g| y.contains(g)),
        _ => true,
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT)
            .map_err(|e| D::Error::custom(format!("invalid time '{}': {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn builtin_covers_every_rotation_day() {
        let set = TemplateSet::builtin().unwrap();
        assert_eq!(set.len(), 24);
        for grade in [6, 9] {
            for day in 1..=6 {
                for late in [false, true] {
                    assert!(!set.blocks_for(grade, day, late).unwrap().is_empty());
                }
            }
        }
    }

    #[test]
    fn late_start_delays_first_block() {
        let set = TemplateSet::builtin().unwrap();
        let regular = set.blocks_for(10, 1, false).unwrap();
        let late = set.blocks_for(10, 1, true).unwrap();
        assert_eq!(regular[0].start, t(8, 0));
        assert_eq!(late[0].start, t(9, 30));
    }

    #[test]
    fn grade_constraints_filter_blocks() {
        let set = TemplateSet::builtin().unwrap();
        let ninth = set.blocks_for(9, 2, false).unwrap();
        let twelfth = set.blocks_for(12, 2, false).unwrap();
        assert!(ninth.iter().any(|b| b.code == "ADV"));
        assert!(!twelfth.iter().any(|b| b.code == "ADV"));
    }

    #[test]
    fn unsupported_levels_and_days() {
        let set = TemplateSet::builtin().unwrap();
        assert!(matches!(
            set.blocks_for(5, 1, false),
            Err(Error::UnsupportedSchoolLevel(5))
        ));
        assert!(matches!(
            set.blocks_for(13, 1, false),
            Err(Error::UnsupportedSchoolLevel(13))
        ));
        assert!(matches!(
            set.blocks_for(9, 7, false),
            Err(Error::InvalidRotationDay(7))
        ));
        assert!(matches!(
            set.blocks_for(9, 0, false),
            Err(Error::InvalidRotationDay(0))
        ));
    }

    #[test]
    fn missing_template_is_reported() {
        let set = TemplateSet::from_json(
            r#"[{"level":"upper","rotationDay":1,"lateStart":false,"blocks":[
                {"code":"A","start":"08:00","end":"09:00"}]}]"#,
        )
        .unwrap();
        assert!(matches!(
            set.blocks_for(9, 2, false),
            Err(Error::TemplateMissing(_))
        ));
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let err = TemplateSet::from_json(
            r#"[{"level":"upper","rotationDay":1,"lateStart":false,"blocks":[
                {"code":"A","start":"08:00","end":"09:00"},
                {"code":"B","start":"08:30","end":"09:30"}]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // 面向不同年级的时段允许重叠
        assert!(
            TemplateSet::from_json(
                r#"[{"level":"middle","rotationDay":1,"lateStart":false,"blocks":[
                {"code":"L6","start":"11:00","end":"11:40","grades":[6]},
                {"code":"L7","start":"11:20","end":"12:00","grades":[7,8]}]}]"#,
            )
            .is_ok()
        );
    }

    #[test]
    fn malformed_time_is_rejected() {
        assert!(
            TemplateSet::from_json(
                r#"[{"level":"upper","rotationDay":1,"lateStart":false,"blocks":[
                {"code":"A","start":"8am","end":"09:00"}]}]"#,
            )
            .is_err()
        );
    }
}
