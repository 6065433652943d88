use std::{io::BufReader, sync::LazyLock};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::{PropertyParser, property::Property};
use regex::Regex;
use uuid::Uuid;

use crate::{Error, Event, Provider, Result, UserId};

/// 最多保留的出错片段数
const MAX_FRAGMENTS: usize = 5;
const FRAGMENT_LEN: usize = 120;

static CANVAS_COURSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]\s*$").expect("valid regex"));
static PORTAL_BLOCK_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s*\(([A-Za-z0-9]{1,3})\)\s*$").expect("valid regex"));

/// 一次解析的结果，尽力而为：坏组件被跳过并计数
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub events: Vec<Event>,
    pub skipped: usize,
    pub fragments: Vec<String>,
}

impl ParsedFeed {
    /// 有组件被跳过时给出对应的 `FeedParse` 错误，供上报
    pub fn partial_error(&self) -> Option<Error> {
        (self.skipped > 0).then(|| Error::FeedParse {
            fragment: self.fragments.first().cloned().unwrap_or_default(),
            skipped: self.skipped,
        })
    }

    fn skip(&mut self, fragment: impl Into<String>) {
        self.skipped += 1;
        if self.fragments.len() < MAX_FRAGMENTS {
            self.fragments.push(truncate(fragment.into()));
        }
    }
}

/// iCalendar feed 解析器
pub struct FeedParser {
    provider: Provider,
    owner: UserId,
    timezone: Tz,
}

impl FeedParser {
    pub fn new(provider: Provider, owner: UserId, timezone: Tz) -> Self {
        Self {
            provider,
            owner,
            timezone,
        }
    }

    /// 解析 feed 文本
    ///
    /// 单个 VEVENT 出错只会被跳过；整个文本不是日历（没有 `BEGIN:VCALENDAR`）
    /// 时返回 `FeedParse`。
    pub fn parse(&self, text: &str) -> Result<ParsedFeed> {
        let properties = PropertyParser::from_reader(BufReader::new(text.as_bytes()));
        let mut parsed = ParsedFeed::default();
        let mut saw_calendar = false;
        let mut current: Option<Vec<Property>> = None;
        let mut broken: Option<String> = None;
        let mut nested = 0usize;

        for item in properties {
            let property = match item {
                Ok(property) => property,
                Err(err) => {
                    if current.is_some() {
                        broken.get_or_insert_with(|| err.to_string());
                    } else {
                        tracing::debug!("Ignoring malformed line outside of an event: {}", err);
                    }
                    continue;
                }
            };

            let value = property.value.as_deref().unwrap_or("").trim();
            if property.name.eq_ignore_ascii_case("BEGIN") {
                if value.eq_ignore_ascii_case("VCALENDAR") {
                    saw_calendar = true;
                } else if value.eq_ignore_ascii_case("VEVENT") {
                    if current.is_some() {
                        parsed.skip(broken.take().unwrap_or_else(|| {
                            "BEGIN:VEVENT inside an unterminated VEVENT".to_string()
                        }));
                    }
                    current = Some(Vec::new());
                    broken = None;
                    nested = 0;
                } else if current.is_some() {
                    nested += 1;
                }
                continue;
            }

            if property.name.eq_ignore_ascii_case("END") {
                if value.eq_ignore_ascii_case("VEVENT") {
                    let Some(props) = current.take() else {
                        continue;
                    };
                    if let Some(fragment) = broken.take() {
                        parsed.skip(fragment);
                        continue;
                    }
                    match self.build_event(&props) {
                        Ok(event) => parsed.events.push(event),
                        Err(fragment) => {
                            tracing::warn!("Skipping {} event: {}", self.provider, fragment);
                            parsed.skip(fragment);
                        }
                    }
                } else if nested > 0 {
                    nested -= 1;
                }
                continue;
            }

            if nested == 0 {
                if let Some(props) = current.as_mut() {
                    props.push(property);
                }
            }
        }

        if current.is_some() {
            parsed.skip(
                broken
                    .take()
                    .unwrap_or_else(|| "truncated feed: BEGIN:VEVENT without END:VEVENT".into()),
            );
        }

        if !saw_calendar {
            let fragment = text.lines().next().unwrap_or_default().to_string();
            return Err(Error::FeedParse {
                fragment: truncate(fragment),
                skipped: parsed.skipped,
            });
        }

        tracing::debug!(
            "Parsed {} {} events ({} skipped)",
            parsed.events.len(),
            self.provider,
            parsed.skipped
        );
        Ok(parsed)
    }

    fn build_event(&self, props: &[Property]) -> std::result::Result<Event, String> {
        let start_prop = find_property(props, "DTSTART").ok_or("missing DTSTART")?;
        let (start, start_is_date) = self.parse_timestamp(start_prop)?;

        let end = match find_property(props, "DTEND") {
            Some(prop) => self.parse_timestamp(prop)?.0,
            None => match property_value(props, "DURATION") {
                Some(raw) => start
                    .checked_add_signed(parse_duration(raw)?)
                    .ok_or_else(|| format!("DURATION:{}", raw))?,
                None if start_is_date => start
                    .checked_add_signed(Duration::days(1))
                    .ok_or("DTSTART out of range")?,
                None => start,
            },
        };

        if end < start {
            return Err(format!(
                "DTEND before DTSTART: {}",
                property_value(props, "DTEND").unwrap_or_default()
            ));
        }

        let title = property_value(props, "SUMMARY")
            .map(unescape_text)
            .unwrap_or_else(|| "Untitled".to_string());
        let location = property_value(props, "LOCATION")
            .map(unescape_text)
            .filter(|s| !s.trim().is_empty());
        let remote_uid = property_value(props, "UID")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}-{}", self.provider, start.timestamp(), title));
        let class_ref = extract_class_ref(self.provider, &title);

        let local_start = start.with_timezone(&self.timezone);
        let is_all_day = local_start.time() == NaiveTime::MIN;

        Ok(Event {
            id: Uuid::new_v4(),
            provider: self.provider,
            remote_uid,
            title,
            location,
            class_ref,
            start,
            end,
            is_all_day,
            owner: self.owner.clone(),
        })
    }

    /// 返回 UTC 时间以及是否为纯日期值
    fn parse_timestamp(&self, prop: &Property) -> std::result::Result<(DateTime<Utc>, bool), String> {
        let raw = prop.value.as_deref().unwrap_or("").trim();
        let bad = || format!("{}:{}", prop.name, raw);

        if let Some(utc) = raw.strip_suffix('Z') {
            let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").map_err(|_| bad())?;
            return Ok((Utc.from_utc_datetime(&naive), false));
        }

        let naive = match NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S") {
            Ok(naive) => (naive, false),
            Err(_) => {
                let date = NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| bad())?;
                (date.and_time(NaiveTime::MIN), true)
            }
        };

        // 夏令时回拨的重复时刻取较早的一个，跳过的时刻视为无效
        let local = tzid(prop)
            .unwrap_or(self.timezone)
            .from_local_datetime(&naive.0)
            .earliest()
            .ok_or_else(bad)?;
        Ok((local.with_timezone(&Utc), naive.1))
    }
}

/// 识别不了的 TZID（例如 Windows 时区名）按学校时区处理
fn tzid(prop: &Property) -> Option<Tz> {
    let params = prop.params.as_ref()?;
    let (_, values) = params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("TZID"))?;
    let raw = values.first()?.trim().trim_matches('"');
    match raw.parse::<Tz>() {
        Ok(zone) => Some(zone),
        Err(_) => {
            tracing::debug!("Unknown TZID '{}', using school timezone", raw);
            None
        }
    }
}

/// 按 provider 约定从标题中提取远端课程名
pub fn extract_class_ref(provider: Provider, title: &str) -> Option<String> {
    let captured = match provider {
        Provider::Canvas => CANVAS_COURSE.captures(title)?.get(1)?.as_str(),
        Provider::Portal => PORTAL_BLOCK_SUFFIX.captures(title)?.get(1)?.as_str(),
    };
    let trimmed = captured.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn find_property<'a>(props: &'a [Property], name: &str) -> Option<&'a Property> {
    props.iter().find(|prop| prop.name.eq_ignore_ascii_case(name))
}

fn property_value<'a>(props: &'a [Property], name: &str) -> Option<&'a str> {
    find_property(props, name).and_then(|prop| prop.value.as_deref())
}

/// 支持 `P1D`、`PT1H30M`、`P1W` 等常见形式
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let bad = || format!("DURATION:{}", raw);
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let body = body.strip_prefix('P').ok_or_else(bad)?;

    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for c in body.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let n: i64 = number.parse().map_err(|_| bad())?;
                number.clear();
                let part = match (unit, in_time) {
                    ('W', false) => Duration::try_weeks(n),
                    ('D', false) => Duration::try_days(n),
                    ('H', true) => Duration::try_hours(n),
                    ('M', true) => Duration::try_minutes(n),
                    ('S', true) => Duration::try_seconds(n),
                    _ => return Err(bad()),
                };
                total = part
                    .and_then(|part| total.checked_add(&part))
                    .ok_or_else(bad)?;
            }
        }
    }
    if !number.is_empty() {
        return Err(bad());
    }

    // 负时长会让 DTEND 早于 DTSTART，交给调用方拒绝
    Ok(if negative { -total } else { total })
}

fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn truncate(mut fragment: String) -> String {
    if fragment.len() > FRAGMENT_LEN {
        let mut cut = FRAGMENT_LEN;
        while !fragment.is_char_boundary(cut) {
            cut -= 1;
        }
        fragment.truncate(cut);
    }
    fragment
}
