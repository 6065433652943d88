use std::{
    collections::{BTreeMap, BTreeSet},
    io::{BufReader, Read},
    path::Path,
};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use ical::parser::ical::{IcalParser, component::IcalEvent};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 轮换周期长度
pub const ROTATION_LENGTH: u8 = 6;

/// 某个上课日使用的轮换日与是否推迟上课
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayInfo {
    pub rotation_day: u8,
    pub late_start: bool,
}

/// 学年轮换日历
///
/// 上课日按 1..=6 循环，跳过周末和停课日；`overrides` 只影响指定的日期本身。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationCalendar {
    pub first_day: NaiveDate,
    #[serde(default)]
    pub last_day: Option<NaiveDate>,
    #[serde(default)]
    pub no_school: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub late_start_weekdays: Vec<Weekday>,
    #[serde(default)]
    pub overrides: BTreeMap<NaiveDate, DayInfo>,
}

impl RotationCalendar {
    pub fn starting(first_day: NaiveDate) -> Self {
        Self {
            first_day,
            last_day: None,
            no_school: BTreeSet::new(),
            late_start_weekdays: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }

    /// 根据日期推断学年：8 月及以后属于当年开始的学年，否则属于上一年
    pub fn for_school_year_of(today: NaiveDate) -> Self {
        let year = if today.month() >= 8 {
            today.year()
        } else {
            today.year() - 1
        };
        let mut first_day = NaiveDate::from_ymd_opt(year, 9, 1).unwrap_or(today);
        while is_weekend(first_day) {
            first_day = first_day.succ_opt().unwrap_or(first_day);
        }

        let mut calendar = Self::starting(first_day);
        calendar.last_day = NaiveDate::from_ymd_opt(year + 1, 6, 30);
        calendar.late_start_weekdays = vec![Weekday::Wed];
        calendar
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|err| {
            Error::Config(format!(
                "Cannot read rotation calendar {}: {}",
                path_ref.display(),
                err
            ))
        })?;
        let calendar: Self = serde_json::from_str(&content)?;
        calendar.validate()?;
        Ok(calendar)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(last) = self.last_day {
            if last < self.first_day {
                return Err(Error::Config(
                    "Rotation calendar ends before it starts".to_string(),
                ));
            }
        }
        for (date, info) in &self.overrides {
            if !(1..=ROTATION_LENGTH).contains(&info.rotation_day) {
                return Err(Error::Config(format!(
                    "Override on {} has invalid rotation day {}",
                    date, info.rotation_day
                )));
            }
        }
        Ok(())
    }

    /// 从停课日 ICS 中加入全部事件覆盖的日期，返回新增的天数
    pub fn add_no_school_from_ics<R: Read>(&mut self, reader: R) -> Result<usize> {
        let parser = IcalParser::new(BufReader::new(reader));
        let before = self.no_school.len();

        for calendar in parser {
            let calendar =
                calendar.map_err(|err| Error::Config(format!("No-school ICS parse failed: {}", err)))?;
            for event in calendar.events {
                self.no_school.extend(extract_event_dates(&event)?);
            }
        }

        let added = self.no_school.len() - before;
        tracing::info!("Loaded {} no-school days from ICS", added);
        Ok(added)
    }

    pub fn is_school_day(&self, date: NaiveDate) -> bool {
        date >= self.first_day
            && self.last_day.is_none_or(|last| date <= last)
            && !is_weekend(date)
            && !self.no_school.contains(&date)
    }

    /// 指定日期的轮换信息，非上课日返回 None
    pub fn day_info(&self, date: NaiveDate) -> Option<DayInfo> {
        if let Some(info) = self.overrides.get(&date) {
            return Some(*info);
        }
        if !self.is_school_day(date) {
            return None;
        }

        let mut school_days_before = 0u32;
        let mut current = self.first_day;
        while current < date {
            if self.is_school_day(current) {
                school_days_before += 1;
            }
            current = current.succ_opt()?;
        }

        let rotation_day = (school_days_before % u32::from(ROTATION_LENGTH)) as u8 + 1;
        Some(DayInfo {
            rotation_day,
            late_start: self.late_start_weekdays.contains(&date.weekday()),
        })
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn extract_event_dates(event: &IcalEvent) -> Result<Vec<NaiveDate>> {
    let start_raw = event_property(event, "DTSTART")
        .ok_or_else(|| Error::Config("No-school event is missing DTSTART".to_string()))?;
    let start = parse_date(start_raw)
        .map_err(|err| Error::Config(format!("Invalid DTSTART {}: {}", start_raw, err)))?;

    let exclusive_end = match event_property(event, "DTEND") {
        Some(value) => parse_date(value)
            .map_err(|err| Error::Config(format!("Invalid DTEND {}: {}", value, err)))?,
        None => start + Duration::days(1),
    };

    if exclusive_end <= start {
        return Ok(vec![start]);
    }

    let mut dates = Vec::new();
    let mut current = start;
    while current < exclusive_end {
        dates.push(current);
        current = current
            .succ_opt()
            .ok_or_else(|| Error::Config("No-school date range overflow".to_string()))?;
    }
    Ok(dates)
}

fn event_property<'a>(event: &'a IcalEvent, name: &str) -> Option<&'a str> {
    event
        .properties
        .iter()
        .find(|prop| prop.name.eq_ignore_ascii_case(name))
        .and_then(|prop| prop.value.as_deref())
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ").map(|dt| dt.date()))
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.date_naive()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn rotation_cycles_over_school_days() {
        // 2024-09-03 是周二
        let calendar = RotationCalendar::starting(d(2024, 9, 3));
        let days: Vec<_> = [3, 4, 5, 6, 9, 10, 11]
            .iter()
            .map(|&day| calendar.day_info(d(2024, 9, day)).unwrap().rotation_day)
            .collect();
        assert_eq!(days, vec![1, 2, 3, 4, 5, 6, 1]);

        assert!(calendar.day_info(d(2024, 9, 7)).is_none());
        assert!(calendar.day_info(d(2024, 9, 2)).is_none());
    }

    #[test]
    fn no_school_days_do_not_advance_rotation() {
        let mut calendar = RotationCalendar::starting(d(2024, 9, 3));
        calendar.no_school.insert(d(2024, 9, 4));
        assert!(calendar.day_info(d(2024, 9, 4)).is_none());
        assert_eq!(calendar.day_info(d(2024, 9, 5)).unwrap().rotation_day, 2);
    }

    #[test]
    fn late_start_and_overrides() {
        let mut calendar = RotationCalendar::starting(d(2024, 9, 3));
        calendar.late_start_weekdays = vec![Weekday::Wed];
        calendar.overrides.insert(
            d(2024, 9, 7),
            DayInfo {
                rotation_day: 4,
                late_start: false,
            },
        );

        assert!(calendar.day_info(d(2024, 9, 4)).unwrap().late_start);
        assert!(!calendar.day_info(d(2024, 9, 5)).unwrap().late_start);
        assert_eq!(calendar.day_info(d(2024, 9, 7)).unwrap().rotation_day, 4);
    }

    #[test]
    fn no_school_days_from_ics() {
        let ics = "BEGIN:VCALENDAR\r
VERSION:2.0\r
BEGIN:VEVENT\r
UID:thanksgiving\r
DTSTART;VALUE=DATE:20241127\r
DTEND;VALUE=DATE:20241130\r
SUMMARY:Thanksgiving Break\r
END:VEVENT\r
END:VCALENDAR\r
";
        let mut calendar = RotationCalendar::starting(d(2024, 9, 3));
        let added = calendar.add_no_school_from_ics(ics.as_bytes()).unwrap();

        assert_eq!(added, 3);
        assert!(!calendar.is_school_day(d(2024, 11, 28)));
        assert!(calendar.is_school_day(d(2024, 11, 26)));
    }

    #[test]
    fn school_year_detection() {
        let autumn = RotationCalendar::for_school_year_of(d(2024, 10, 15));
        assert_eq!(autumn.first_day, d(2024, 9, 2));
        let spring = RotationCalendar::for_school_year_of(d(2025, 3, 1));
        assert_eq!(spring.first_day, d(2024, 9, 2));
        assert_eq!(spring.last_day, Some(d(2025, 6, 30)));
    }

    #[test]
    fn override_with_invalid_rotation_day_is_rejected() {
        let json = r#"{
            "firstDay": "2024-09-03",
            "noSchool": ["2024-10-14"],
            "lateStartWeekdays": ["Wed"],
            "overrides": {"2024-09-28": {"rotationDay": 9, "lateStart": false}}
        }"#;
        let calendar: RotationCalendar = serde_json::from_str(json).unwrap();
        assert!(calendar.validate().is_err());
    }
}
