use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterBlueprintEntry {
    pub number: u32,
    pub title: String,
    pub position: String,
    pub purpose: String,
    pub suspense: String,
    pub hook: String,
    pub tension: String,
    pub synopsis: String,
    pub conflict: String,
    pub reward: String,
}

impl ChapterBlueprintEntry {
    pub fn field(&self, field: BlueprintField) -> &str {
        match field {
            BlueprintField::Position => &self.position,
            BlueprintField::Purpose => &self.purpose,
            BlueprintField::Suspense => &self.suspense,
            BlueprintField::Hook => &self.hook,
            BlueprintField::Tension => &self.tension,
            BlueprintField::Synopsis => &self.synopsis,
            BlueprintField::Conflict => &self.conflict,
            BlueprintField::Reward => &self.reward,
        }
    }

    fn field_mut(&mut self, field: BlueprintField) -> &mut String {
        match field {
            BlueprintField::Position => &mut self.position,
            BlueprintField::Purpose => &mut self.purpose,
            BlueprintField::Suspense => &mut self.suspense,
            BlueprintField::Hook => &mut self.hook,
            BlueprintField::Tension => &mut self.tension,
            BlueprintField::Synopsis => &mut self.synopsis,
            BlueprintField::Conflict => &mut self.conflict,
            BlueprintField::Reward => &mut self.reward,
        }
    }
}

/// Narrative attributes carried by one outline entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlueprintField {
    Position,
    Purpose,
    Suspense,
    Hook,
    Tension,
    Synopsis,
    Conflict,
    Reward,
}

impl BlueprintField {
    pub const ALL: [BlueprintField; 8] = [
        BlueprintField::Position,
        BlueprintField::Purpose,
        BlueprintField::Suspense,
        BlueprintField::Hook,
        BlueprintField::Tension,
        BlueprintField::Synopsis,
        BlueprintField::Conflict,
        BlueprintField::Reward,
    ];

    /// Accepted labels, highest priority first. Newer outline formats come
    /// before the older ones they replaced.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Self::Position => &["承接点", "本章定位", "开场钩子", "Position", "Chapter Role"],
            Self::Purpose => &["本章爽点兑现", "核心作用", "本章冲突", "Payoff", "Purpose"],
            Self::Suspense => &["情绪曲线", "悬念密度", "Emotional Curve", "Suspense"],
            Self::Hook => &["章末卡点", "伏笔操作", "Cliffhanger", "Foreshadowing"],
            Self::Tension => &["张力星级", "认知颠覆", "Tension", "Twist Level"],
            Self::Synopsis => &["一句话剧情", "本章简述", "Synopsis", "Summary"],
            Self::Conflict => &["本章冲突", "Conflict"],
            Self::Reward => &["本章收益", "Reward"],
        }
    }

    fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|candidate| candidate == self)
            .unwrap_or_default()
    }

    fn label_patterns(&self) -> &'static [Regex] {
        static PATTERNS: OnceLock<Vec<Vec<Regex>>> = OnceLock::new();
        let all = PATTERNS.get_or_init(|| {
            BlueprintField::ALL
                .iter()
                .map(|field| {
                    field
                        .labels()
                        .iter()
                        .map(|label| {
                            Regex::new(&format!(
                                r"(?m){}[ \t]*[：:][ \t]*(.*?)[ \t]*$",
                                regex::escape(label)
                            ))
                            .expect("invalid blueprint label regex")
                        })
                        .collect()
                })
                .collect()
        });
        &all[self.index()]
    }

    fn extract(&self, span: &str) -> String {
        self.label_patterns()
            .iter()
            .filter_map(|pattern| pattern.captures(span))
            .filter_map(|caps| caps.get(1))
            .map(|value| strip_brackets(value.as_str()))
            .find(|value| !value.is_empty())
            .unwrap_or_default()
    }
}

/// Extracts outline entries in source order. Each entry's span runs from its
/// heading to the next mention of chapter `number + 1`, or to the end of the
/// text when there is none.
pub fn parse(text: &str) -> Vec<ChapterBlueprintEntry> {
    let text = text.replace("\r\n", "\n");
    if text.trim().is_empty() {
        return Vec::new();
    }

    let markers = chapter_markers(&text);
    heading_regex()
        .captures_iter(&text)
        .filter_map(|caps| {
            let number = chapter_number(&caps)?;
            let whole = caps.get(0)?;
            let title = caps.get(3).map(|m| strip_brackets(m.as_str()))?;

            let end = markers
                .iter()
                .find(|(marker, start)| *marker == number.wrapping_add(1) && *start >= whole.end())
                .map(|(_, start)| *start)
                .unwrap_or(text.len());
            let span = &text[whole.start()..end];

            let mut entry = ChapterBlueprintEntry {
                number,
                title,
                ..ChapterBlueprintEntry::default()
            };
            for field in BlueprintField::ALL {
                *entry.field_mut(field) = field.extract(span);
            }
            Some(entry)
        })
        .collect()
}

/// Keeps only the trailing `limit` chapter segments when the outline holds
/// more than that; otherwise returns the text unchanged.
pub fn truncate_to_recent(text: &str, limit: usize) -> String {
    let starts: Vec<usize> = marker_regex().find_iter(text).map(|m| m.start()).collect();
    if starts.len() <= limit {
        return text.to_string();
    }
    if limit == 0 {
        return String::new();
    }

    let keep_from = starts.len() - limit;
    let mut segments = Vec::with_capacity(limit);
    for (index, start) in starts.iter().enumerate().skip(keep_from) {
        let end = starts.get(index + 1).copied().unwrap_or(text.len());
        segments.push(text[*start..end].trim());
    }
    segments.join("\n\n")
}

/// Highest chapter number mentioned anywhere in the outline.
pub fn max_chapter_number(text: &str) -> Option<u32> {
    chapter_markers(text).into_iter().map(|(number, _)| number).max()
}

fn chapter_markers(text: &str) -> Vec<(u32, usize)> {
    marker_regex()
        .captures_iter(text)
        .filter_map(|caps| Some((chapter_number(&caps)?, caps.get(0)?.start())))
        .collect()
}

fn chapter_number(caps: &Captures<'_>) -> Option<u32> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

fn strip_brackets(value: &str) -> String {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(']').unwrap_or(trimmed);
    trimmed.trim().to_string()
}

fn heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)(?:第[ \t]*(\d+)[ \t]*章|Chapter[ \t]+(\d+))[ \t]*[｜|－\-–—:：][ \t]*(.+?)[ \t]*$",
        )
        .expect("invalid chapter heading regex")
    })
}

fn marker_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"第\s*(\d+)\s*章|Chapter\s+(\d+)\b").expect("invalid chapter marker regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC: &str = "第1章 - [紫极光下的预兆]
本章定位：[角色线]
核心作用：[铺垫世界观]
悬念密度：[渐进]
伏笔操作：[埋设-遗迹闪光]
认知颠覆：[★☆☆☆☆]
本章简述：[主人公第一次见到紫极光]

第2章 - 风暴前的协议
本章定位：政治冲突
核心作用：推进矛盾
悬念密度：紧凑
伏笔操作：强化-盟约
认知颠覆：★★☆☆☆
本章简述：主人公与反抗军签订协议
本章冲突：议会施压
本章收益：获得通行令
";

    #[test]
    fn parses_classic_labels() {
        let entries = parse(CLASSIC);
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.title, "紫极光下的预兆");
        assert_eq!(first.position, "角色线");
        assert_eq!(first.purpose, "铺垫世界观");
        assert_eq!(first.suspense, "渐进");
        assert_eq!(first.hook, "埋设-遗迹闪光");
        assert_eq!(first.tension, "★☆☆☆☆");
        assert_eq!(first.synopsis, "主人公第一次见到紫极光");
        assert_eq!(first.conflict, "");
        assert_eq!(first.reward, "");

        let second = &entries[1];
        assert_eq!(second.title, "风暴前的协议");
        assert_eq!(second.tension, "★★☆☆☆");
        assert_eq!(second.conflict, "议会施压");
        assert_eq!(second.reward, "获得通行令");
    }

    #[test]
    fn prefers_newer_labels() {
        let text = "第3章｜夜袭
承接点：上一章的追兵赶到
本章定位：过渡
本章爽点兑现：反杀追兵
情绪曲线：压抑到爆发
章末卡点：神秘人现身
张力星级：★★★★☆
一句话剧情：主角借地形反杀追兵
";
        let entry = &parse(text)[0];
        assert_eq!(entry.number, 3);
        assert_eq!(entry.title, "夜袭");
        assert_eq!(entry.position, "上一章的追兵赶到");
        assert_eq!(entry.purpose, "反杀追兵");
        assert_eq!(entry.suspense, "压抑到爆发");
        assert_eq!(entry.hook, "神秘人现身");
        assert_eq!(entry.tension, "★★★★☆");
        assert_eq!(entry.synopsis, "主角借地形反杀追兵");
    }

    #[test]
    fn every_label_is_recognised() {
        for field in BlueprintField::ALL {
            for label in field.labels() {
                let text = format!("第1章 - 标题\n{label}：值{label}\n");
                let entry = &parse(&text)[0];
                assert_eq!(
                    entry.field(field),
                    format!("值{label}"),
                    "label {label} for {field:?}"
                );
            }
        }
    }

    #[test]
    fn purpose_falls_back_to_conflict_label() {
        let entry = &parse("第1章 - 甲\n本章冲突：宗门逼婚\n")[0];
        assert_eq!(entry.purpose, "宗门逼婚");
        assert_eq!(entry.conflict, "宗门逼婚");
    }

    #[test]
    fn empty_label_value_uses_next_synonym() {
        let entry = &parse("第1章 - 甲\n承接点：\n本章定位：开篇\n")[0];
        assert_eq!(entry.position, "开篇");
    }

    #[test]
    fn accepts_separator_variants_and_english_headings() {
        let text = "第1章 — 破晓\n\n第 2 章－远行\n\nChapter 3: The Gate\nSynopsis: they reach the gate\n\n第4章|归来\n";
        let entries = parse(text);
        let numbers: Vec<u32> = entries.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(entries[1].title, "远行");
        assert_eq!(entries[2].title, "The Gate");
        assert_eq!(entries[2].synopsis, "they reach the gate");
    }

    #[test]
    fn span_ends_at_expected_successor() {
        let text = "第1章 - 甲\n本章简述：一\n\n第3章 - 丙\n本章冲突：三的冲突\n\n第2章 - 乙\n本章简述：二\n";
        let entries = parse(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].number, 1);
        // chapter 1 runs until the chapter 2 heading, so it swallows chapter 3's fields
        assert_eq!(entries[0].conflict, "三的冲突");
        assert_eq!(entries[1].number, 3);
        assert_eq!(entries[1].synopsis, "二");
    }

    #[test]
    fn round_trip_of_well_formed_outline() {
        let mut text = String::new();
        for number in 1..=12 {
            text.push_str(&format!(
                "第{number}章 - 标题{number}\n本章定位：定位{number}\n核心作用：作用{number}\n悬念密度：渐进\n伏笔操作：埋设\n认知颠覆：★☆☆☆☆\n本章简述：简述{number}\n本章冲突：冲突{number}\n本章收益：收益{number}\n\n"
            ));
        }
        let entries = parse(&text);
        assert_eq!(entries.len(), 12);
        for (index, entry) in entries.iter().enumerate() {
            let number = index as u32 + 1;
            assert_eq!(entry.number, number);
            assert_eq!(entry.title, format!("标题{number}"));
            assert_eq!(entry.synopsis, format!("简述{number}"));
            assert_eq!(entry.reward, format!("收益{number}"));
        }
    }

    #[test]
    fn handles_crlf_and_empty_input() {
        assert!(parse("").is_empty());
        assert!(parse("没有任何章节标题").is_empty());
        let entry = &parse("第1章 - 甲\r\n本章简述：一\r\n")[0];
        assert_eq!(entry.title, "甲");
        assert_eq!(entry.synopsis, "一");
    }

    #[test]
    fn truncate_keeps_trailing_segments() {
        let text = "前言\n第1章 - 甲\n内容一\n\n第2章 - 乙\n内容二\n\n第3章 - 丙\n内容三\n";
        assert_eq!(truncate_to_recent(text, 3), text);
        assert_eq!(truncate_to_recent(text, 5), text);
        assert_eq!(
            truncate_to_recent(text, 2),
            "第2章 - 乙\n内容二\n\n第3章 - 丙\n内容三"
        );
        assert_eq!(truncate_to_recent(text, 0), "");
    }

    #[test]
    fn max_chapter_number_scans_all_mentions() {
        assert_eq!(max_chapter_number(""), None);
        assert_eq!(max_chapter_number(CLASSIC), Some(2));
        assert_eq!(
            max_chapter_number("第1章 - 甲\n伏笔操作：为第 12 章埋线\n"),
            Some(12)
        );
    }
}
