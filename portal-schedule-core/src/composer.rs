use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_tz::Tz;

use crate::{
    EntryLabel, EntrySource, Error, FeedKey, MergedScheduleEntry, Provider, Result, UserId,
    alias::AliasResolver, feed_cache::FeedCache, template::{TemplateBlock, TemplateSet},
};

/// 合并课表的输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub user: UserId,
    pub grade: u8,
    pub rotation_day: u8,
    pub late_start: bool,
    pub date: NaiveDate,
}

/// 把通用轮换课表和用户 feed 中的真实日程合并成一天的课表
#[derive(Clone)]
pub struct ScheduleComposer {
    templates: Arc<TemplateSet>,
    cache: FeedCache,
    aliases: AliasResolver,
    timezone: Tz,
}

impl ScheduleComposer {
    pub fn new(
        templates: Arc<TemplateSet>,
        cache: FeedCache,
        aliases: AliasResolver,
        timezone: Tz,
    ) -> Self {
        Self {
            templates,
            cache,
            aliases,
            timezone,
        }
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    pub async fn compose(&self, request: &ScheduleRequest) -> Result<Vec<MergedScheduleEntry>> {
        let blocks = self
            .templates
            .blocks_for(request.grade, request.rotation_day, request.late_start)?;
        let generic = blocks
            .into_iter()
            .map(|block| self.block_entry(block, request.date))
            .collect::<Result<Vec<_>>>()?;

        let mut feed = Vec::new();
        for provider in Provider::ALL {
            let key = FeedKey::new(request.user.clone(), provider);
            for event in self.cache.read(&key).await? {
                if event.is_all_day {
                    continue;
                }
                let start = event.start.with_timezone(&self.timezone).fixed_offset();
                if start.date_naive() != request.date {
                    continue;
                }

                let identity = self.aliases.resolve(provider, event.class_key()).await?;
                feed.push(MergedScheduleEntry {
                    label: EntryLabel::Class(identity),
                    title: event.title,
                    location: event.location,
                    start,
                    end: event.end.with_timezone(&self.timezone).fixed_offset(),
                    source: EntrySource::Feed,
                });
            }
        }

        tracing::debug!(
            "Composing {} for {}: {} blocks, {} feed events",
            request.date,
            request.user,
            generic.len(),
            feed.len()
        );
        Ok(merge_day(generic, feed))
    }

    fn block_entry(&self, block: &TemplateBlock, date: NaiveDate) -> Result<MergedScheduleEntry> {
        let (start, end) = self.local(date, block)?;
        Ok(MergedScheduleEntry {
            label: EntryLabel::Block(block.code.clone()),
            title: block.display_name().to_string(),
            location: None,
            start,
            end,
            source: EntrySource::Generic,
        })
    }

    fn local(
        &self,
        date: NaiveDate,
        block: &TemplateBlock,
    ) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        let at = |time| {
            date.and_time(time)
                .and_local_timezone(self.timezone)
                .earliest()
                .map(|at| at.fixed_offset())
                .ok_or_else(|| Error::Internal(format!("Cannot place {} on {}", block.code, date)))
        };
        Ok((at(block.start)?, at(block.end)?))
    }
}

/// 合并一天的通用时段和 feed 日程
///
/// - feed 日程之间：开始早的优先，后开始且重叠的顺延到前者结束之后；
/// - feed 与通用时段：feed 优先，通用时段裁剪为不重叠的剩余部分，完全覆盖时丢弃；
/// - 结果按 (start, end) 排序，任意两条的 `[start, end)` 不相交。
pub fn merge_day(
    generic: Vec<MergedScheduleEntry>,
    mut feed: Vec<MergedScheduleEntry>,
) -> Vec<MergedScheduleEntry> {
    feed.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then_with(|| a.title.cmp(&b.title))
    });

    let mut placed: Vec<MergedScheduleEntry> = Vec::with_capacity(feed.len());
    let mut cursor: Option<DateTime<FixedOffset>> = None;
    for mut entry in feed {
        if let Some(busy_until) = cursor {
            if entry.start < busy_until {
                let duration = entry.end - entry.start;
                entry.start = busy_until;
                if entry.end <= busy_until {
                    entry.end = busy_until + duration;
                }
            }
        }
        cursor = Some(cursor.map_or(entry.end, |c| c.max(entry.end)));
        placed.push(entry);
    }

    let mut merged = Vec::with_capacity(generic.len() + placed.len());
    for block in generic {
        let mut pieces = vec![block];
        for event in &placed {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| cut_out(piece, event))
                .collect();
        }
        merged.extend(pieces);
    }
    merged.extend(placed);

    merged.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    merged
}

/// 从通用时段中去掉被 feed 日程占用的部分
fn cut_out(piece: MergedScheduleEntry, event: &MergedScheduleEntry) -> Vec<MergedScheduleEntry> {
    if !(event.start < piece.end && piece.start < event.end) {
        return vec![piece];
    }

    let mut rest = Vec::with_capacity(2);
    if piece.start < event.start {
        rest.push(MergedScheduleEntry {
            end: event.start,
            ..piece.clone()
        });
    }
    if event.end < piece.end {
        rest.push(MergedScheduleEntry {
            start: event.end,
            ..piece
        });
    }
    rest
}
