use crate::blueprint::ChapterBlueprintEntry;
use crate::project::Project;
use crate::prompts::{PromptArguments, PromptError, PromptKey, PromptRegistry};
use crate::sanitize::tail_chars;

pub(crate) const PREVIOUS_EXCERPT_CHARS: usize = 800;
const NO_PREVIOUS_CHAPTER: &str = "(无前章内容)";
const NO_GLOBAL_SUMMARY: &str = "(这是第一章，暂无前文摘要)";
const NO_CHARACTER_STATE: &str = "(暂无角色状态)";

/// Stand-in values for the chapter after the one being written when the
/// outline does not reach it yet.
struct NextChapter {
    title: String,
    role: String,
    purpose: String,
    suspense: String,
    foreshadowing: String,
    twist: String,
    summary: String,
}

impl NextChapter {
    fn from_entry(next: Option<&ChapterBlueprintEntry>) -> Self {
        match next {
            Some(entry) => Self {
                title: entry.title.clone(),
                role: entry.position.clone(),
                purpose: entry.purpose.clone(),
                suspense: entry.suspense.clone(),
                foreshadowing: entry.hook.clone(),
                twist: entry.tension.clone(),
                summary: entry.synopsis.clone(),
            },
            None => Self {
                title: "(未定)".to_string(),
                role: "过渡章节".to_string(),
                purpose: "承上启下".to_string(),
                suspense: "中等".to_string(),
                foreshadowing: "无特殊伏笔".to_string(),
                twist: "★☆☆☆☆".to_string(),
                summary: "衔接过渡内容".to_string(),
            },
        }
    }
}

/// Setting block embedded in every chapter prompt.
pub fn novel_setting(project: &Project) -> String {
    format!(
        "\n小说类型：{}\n\n核心种子：{}\n\n角色体系：{}\n\n世界观：{}\n\n情节架构：{}\n",
        project.genre_label(),
        project.core_seed,
        project.character_dynamics,
        project.world_building,
        project.plot_architecture,
    )
}

pub fn render_first_chapter_prompt(
    prompts: &PromptRegistry,
    project: &Project,
    chapter: &ChapterBlueprintEntry,
    next: Option<&ChapterBlueprintEntry>,
) -> Result<String, PromptError> {
    let args = chapter_arguments(project, chapter, next);
    prompts.format(PromptKey::FirstChapterDraft, &args)
}

pub fn render_next_chapter_prompt(
    prompts: &PromptRegistry,
    project: &Project,
    chapter: &ChapterBlueprintEntry,
    next: Option<&ChapterBlueprintEntry>,
) -> Result<String, PromptError> {
    let mut args = chapter_arguments(project, chapter, next);
    args.insert(
        "global_summary".into(),
        or_fallback(&project.global_summary, NO_GLOBAL_SUMMARY),
    );
    args.insert(
        "previous_chapter_excerpt".into(),
        previous_excerpt(project, chapter.number),
    );
    args.insert(
        "character_state".into(),
        or_fallback(&project.character_state, NO_CHARACTER_STATE),
    );

    prompts.format(PromptKey::NextChapterDraft, &args)
}

/// Trailing excerpt of the chapter before `number`, or a marker when that
/// chapter has not been written.
pub(crate) fn previous_excerpt(project: &Project, number: u32) -> String {
    let previous = number
        .checked_sub(1)
        .and_then(|previous| project.chapter(previous))
        .unwrap_or_default();
    let excerpt = tail_chars(previous, PREVIOUS_EXCERPT_CHARS);
    if excerpt.is_empty() {
        NO_PREVIOUS_CHAPTER.to_string()
    } else {
        excerpt.to_string()
    }
}

fn chapter_arguments(
    project: &Project,
    chapter: &ChapterBlueprintEntry,
    next: Option<&ChapterBlueprintEntry>,
) -> PromptArguments {
    let mut args = PromptArguments::new();
    args.insert("chapter_number".into(), chapter.number.to_string());
    args.insert("chapter_title".into(), chapter.title.clone());
    args.insert("chapter_role".into(), chapter.position.clone());
    args.insert("chapter_purpose".into(), chapter.purpose.clone());
    args.insert("suspense_level".into(), chapter.suspense.clone());
    args.insert("foreshadowing".into(), chapter.hook.clone());
    args.insert("plot_twist_level".into(), chapter.tension.clone());
    args.insert("chapter_summary".into(), chapter.synopsis.clone());
    args.insert("chapter_conflict".into(), chapter.conflict.clone());
    args.insert("chapter_reward".into(), chapter.reward.clone());
    args.insert("word_number".into(), project.word_number.to_string());
    args.insert(
        "user_guidance".into(),
        user_guidance_value(&project.user_guidance),
    );
    args.insert("novel_setting".into(), novel_setting(project));

    let upcoming = NextChapter::from_entry(next);
    args.insert(
        "next_chapter_number".into(),
        chapter.number.saturating_add(1).to_string(),
    );
    args.insert("next_chapter_title".into(), upcoming.title);
    args.insert("next_chapter_role".into(), upcoming.role);
    args.insert("next_chapter_purpose".into(), upcoming.purpose);
    args.insert("next_chapter_suspense_level".into(), upcoming.suspense);
    args.insert("next_chapter_foreshadowing".into(), upcoming.foreshadowing);
    args.insert("next_chapter_plot_twist_level".into(), upcoming.twist);
    args.insert("next_chapter_summary".into(), upcoming.summary);
    args
}

fn or_fallback(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn user_guidance_value(value: &str) -> String {
    or_fallback(value, "无特殊指导")
}
