use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChapterError;
use crate::orchestrator::{Stage, StageContext};
use crate::project::Project;
use crate::prompts::{PromptArguments, PromptError, PromptKey};

/// Accepted deviation from the target length, shared by the quality check
/// and the repair prompt.
pub const WORD_COUNT_TOLERANCE: f64 = 0.15;

const QUALITY_REQUEST_SKIPPED: &str = "质检请求失败，已跳过";
const QUALITY_PARSE_SKIPPED: &str = "质检结果解析失败，已跳过";
const NOT_AVAILABLE: &str = "(无)";
const OVERALL_PASS_KEY: &str = "overallPass";

/// Counts CJK ideographs individually and every other run of alphanumeric
/// characters as one word.
pub fn count_words(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for ch in text.chars() {
        if is_cjk(ch) {
            count += 1;
            in_word = false;
        } else if ch.is_alphanumeric() {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
        }
    }
    count
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch,
        '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{20000}'..='\u{2A6DF}'
            | '\u{2A700}'..='\u{2EBEF}'
    )
}

/// Inclusive word-count window around `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordCountBand {
    pub min: usize,
    pub max: usize,
}

impl WordCountBand {
    pub fn around(target: u32) -> Self {
        let target = f64::from(target);
        Self {
            min: (target * (1.0 - WORD_COUNT_TOLERANCE) - 1e-9).ceil().max(0.0) as usize,
            max: (target * (1.0 + WORD_COUNT_TOLERANCE) + 1e-9).floor() as usize,
        }
    }

    pub fn contains(&self, words: usize) -> bool {
        (self.min..=self.max).contains(&words)
    }

    fn percent_range(&self) -> String {
        let low = ((1.0 - WORD_COUNT_TOLERANCE) * 100.0).round();
        let high = ((1.0 + WORD_COUNT_TOLERANCE) * 100.0).round();
        format!("{low}%-{high}%")
    }

    fn verdict(&self, words: usize) -> String {
        if self.contains(words) {
            format!("在{}范围内，通过", self.percent_range())
        } else {
            format!("超出{}范围，不通过", self.percent_range())
        }
    }
}

/// Outcome of one quality check. Missing fields in the model's JSON count as
/// passing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityReport {
    pub word_count: usize,
    pub word_count_pass: bool,
    pub content_match: bool,
    /// `true` when the chapter already tells events of the next chapter.
    #[serde(rename = "nextChapterSpill")]
    pub next_chapter_leak: bool,
    pub has_cliffhanger: bool,
    pub overall_pass: bool,
    pub issues: Vec<String>,
}

impl Default for QualityReport {
    fn default() -> Self {
        Self {
            word_count: 0,
            word_count_pass: true,
            content_match: true,
            next_chapter_leak: false,
            has_cliffhanger: true,
            overall_pass: true,
            issues: Vec::new(),
        }
    }
}

impl QualityReport {
    /// Passing report used when the check could not run.
    pub fn skipped(word_count: usize, reason: &str) -> Self {
        Self {
            word_count,
            issues: vec![reason.to_string()],
            ..Self::default()
        }
    }

    pub fn is_fully_passing(&self) -> bool {
        self.overall_pass
            && self.word_count_pass
            && self.content_match
            && !self.next_chapter_leak
            && self.has_cliffhanger
    }
}

/// Outline context a chapter is judged against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityContext {
    pub chapter_number: u32,
    pub chapter_title: String,
    pub chapter_summary: String,
    pub word_number: u32,
    pub next_chapter_number: u32,
    pub next_chapter_title: String,
    pub next_chapter_summary: String,
}

impl QualityContext {
    pub fn from_project(project: &Project, chapter_number: u32) -> Result<Self, ChapterError> {
        let blueprint = project.blueprint();
        let chapter = blueprint
            .entry(chapter_number)
            .ok_or(ChapterError::ChapterNotFound {
                number: chapter_number,
            })?;
        let next_chapter_number = chapter_number.saturating_add(1);
        let next = blueprint.entry(next_chapter_number);

        Ok(Self {
            chapter_number,
            chapter_title: chapter.title.clone(),
            chapter_summary: chapter.synopsis.clone(),
            word_number: project.word_number,
            next_chapter_number,
            next_chapter_title: next
                .map(|entry| entry.title.clone())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            next_chapter_summary: next
                .map(|entry| entry.synopsis.clone())
                .filter(|summary| !summary.is_empty())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        })
    }

    fn band(&self) -> WordCountBand {
        WordCountBand::around(self.word_number)
    }

    fn base_arguments(&self) -> PromptArguments {
        let band = self.band();
        PromptArguments::from([
            ("chapter_number".to_string(), self.chapter_number.to_string()),
            ("chapter_title".to_string(), self.chapter_title.clone()),
            ("chapter_summary".to_string(), self.chapter_summary.clone()),
            ("word_number".to_string(), self.word_number.to_string()),
            (
                "next_chapter_number".to_string(),
                self.next_chapter_number.to_string(),
            ),
            (
                "next_chapter_title".to_string(),
                self.next_chapter_title.clone(),
            ),
            (
                "next_chapter_summary".to_string(),
                self.next_chapter_summary.clone(),
            ),
            ("min_words".to_string(), band.min.to_string()),
            ("max_words".to_string(), band.max.to_string()),
        ])
    }
}

/// Finds the first JSON object in `response` that reads as a report. An
/// object only counts when it carries `overallPass`, either itself or in one
/// directly nested object.
pub fn parse_quality_report(response: &str) -> Option<QualityReport> {
    response.match_indices('{').find_map(|(index, _)| {
        serde_json::Deserializer::from_str(&response[index..])
            .into_iter::<Value>()
            .next()
            .and_then(Result::ok)
            .and_then(report_from_value)
    })
}

fn report_from_value(value: Value) -> Option<QualityReport> {
    let Value::Object(object) = value else {
        return None;
    };
    if object.contains_key(OVERALL_PASS_KEY) {
        return serde_json::from_value(Value::Object(object)).ok();
    }
    object.into_iter().find_map(|(_, nested)| match nested {
        Value::Object(inner) if inner.contains_key(OVERALL_PASS_KEY) => {
            serde_json::from_value(Value::Object(inner)).ok()
        }
        _ => None,
    })
}

/// Optional assistive passes. Neither method fails: infrastructure problems
/// degrade to a passing report or the unchanged text.
pub struct QualityService<'a> {
    ctx: StageContext<'a>,
}

impl<'a> QualityService<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    pub async fn check_quality(&self, chapter_text: &str, context: &QualityContext) -> QualityReport {
        let actual = count_words(chapter_text);
        let band = context.band();
        let word_count_pass = band.contains(actual);
        log::info!(
            "第{}章质检：实际字数 {actual}，目标字数 {}",
            context.chapter_number,
            context.word_number
        );

        let prompt = match self.render_check(chapter_text, context, actual, band) {
            Ok(prompt) => prompt,
            Err(err) => {
                log::warn!("质检提示词渲染失败：{err}");
                return QualityReport::skipped(actual, QUALITY_REQUEST_SKIPPED);
            }
        };

        let response = match self.ctx.invoke_once(Stage::QualityCheck, &prompt).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("质检请求失败：{err}");
                return QualityReport::skipped(actual, QUALITY_REQUEST_SKIPPED);
            }
        };

        match parse_quality_report(&response) {
            Some(mut report) => {
                report.word_count = actual;
                report.word_count_pass = word_count_pass;
                report.overall_pass = report.is_fully_passing();
                report
            }
            None => {
                log::warn!("质检结果解析失败，按通过处理");
                QualityReport::skipped(actual, QUALITY_PARSE_SKIPPED)
            }
        }
    }

    /// Rewrites the failing aspects of `chapter_text`. A report with
    /// `overall_pass` set returns the text untouched without a request.
    pub async fn fix_chapter(
        &self,
        chapter_text: &str,
        report: &QualityReport,
        context: &QualityContext,
    ) -> String {
        if report.overall_pass {
            return chapter_text.to_string();
        }

        self.ctx.report("正在根据质检结果修复章节...", 0, 1);
        let prompt = match self.render_fix(chapter_text, report, context) {
            Ok(prompt) => prompt,
            Err(err) => {
                log::warn!("修复提示词渲染失败：{err}");
                self.ctx.report("修复失败", 1, 1);
                return chapter_text.to_string();
            }
        };

        match self.ctx.invoke_streamed(Stage::Repair, &prompt, None).await {
            Ok(fixed) if !fixed.is_empty() => {
                self.ctx.report("修复完成", 1, 1);
                fixed
            }
            Ok(_) => {
                log::warn!("修复结果为空，保留原文");
                self.ctx.report("修复完成", 1, 1);
                chapter_text.to_string()
            }
            Err(err) => {
                log::warn!("修复失败：{err}");
                self.ctx.report("修复失败", 1, 1);
                chapter_text.to_string()
            }
        }
    }

    fn render_check(
        &self,
        chapter_text: &str,
        context: &QualityContext,
        actual: usize,
        band: WordCountBand,
    ) -> Result<String, PromptError> {
        let mut args = context.base_arguments();
        args.insert("chapter_text".into(), chapter_text.to_string());
        args.insert("actual_word_count".into(), actual.to_string());
        args.insert("word_count_pass".into(), band.contains(actual).to_string());
        args.insert("word_count_verdict".into(), band.verdict(actual));
        self.ctx.prompts().format(PromptKey::QualityCheck, &args)
    }

    fn render_fix(
        &self,
        chapter_text: &str,
        report: &QualityReport,
        context: &QualityContext,
    ) -> Result<String, PromptError> {
        let prompts = self.ctx.prompts();
        let mut instructions = Vec::new();
        if !report.word_count_pass {
            instructions.push(prompts.format_with(
                PromptKey::RepairWordCount,
                [
                    ("actual_word_count", report.word_count.to_string()),
                    ("word_number", context.word_number.to_string()),
                ],
            )?);
        }
        if report.next_chapter_leak {
            instructions.push(prompts.format_with(
                PromptKey::RepairNextChapterLeak,
                [
                    ("next_chapter_number", context.next_chapter_number.to_string()),
                    ("next_chapter_title", context.next_chapter_title.clone()),
                ],
            )?);
        }
        if !report.has_cliffhanger {
            instructions.push(prompts.format(PromptKey::RepairCliffhanger, &PromptArguments::new())?);
        }
        if !report.content_match {
            instructions.push(prompts.format_with(
                PromptKey::RepairContentMatch,
                [("chapter_summary", context.chapter_summary.clone())],
            )?);
        }

        let issues = if report.issues.is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            report
                .issues
                .iter()
                .enumerate()
                .map(|(index, issue)| format!("{}. {issue}", index + 1))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut args = context.base_arguments();
        args.insert("chapter_text".into(), chapter_text.to_string());
        args.insert("issues".into(), issues);
        args.insert(
            "repair_instructions".into(),
            instructions
                .iter()
                .map(|text| text.trim())
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
        prompts.format(PromptKey::FixChapter, &args)
    }
}
