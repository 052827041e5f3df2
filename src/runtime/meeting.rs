//! Meeting Engine (§4.7): scripted multi-turn conversation among
//! department team leaders, driven by one-shot CLI invocations, used for
//! both the pre-kickoff planned-approval meeting and the post-execution
//! review-consensus meeting.
//!
//! The turn-sequencing and sleep-pacing shape follows the orchestrator's
//! general async-state-machine style, and the one-shot CLI contract reuses
//! `child_runner::run_one_shot`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::bus::{event_types, EventBus};
use crate::core::department::{Role, DEPARTMENTS};
use crate::core::locale::{resolve_locale, Locale};
use crate::db::queries::{self, AgentRow, MeetingMinuteEntryRow, MeetingMinutesRow};
use crate::db::{Database, DbError};
use crate::runtime::child_runner;
use crate::runtime::pretty_print::pretty_print;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingKind {
    Planned,
    Review,
}

impl MeetingKind {
    fn db_type(self) -> &'static str {
        match self {
            MeetingKind::Planned => "planned",
            MeetingKind::Review => "review",
        }
    }

    fn guard_key(self, task_id: &str) -> String {
        match self {
            MeetingKind::Planned => format!("planned:{task_id}"),
            MeetingKind::Review => task_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Opening,
    Feedback,
    Summary,
    Approval,
}

pub struct MeetingOutcome {
    pub needs_revision: bool,
    pub revise_owner: Option<String>,
}

/// Re-entrancy guard + shared timeout knobs for meeting turns.
pub struct MeetingEngine {
    in_flight: DashMap<String, ()>,
}

impl Default for MeetingEngine {
    fn default() -> Self {
        Self::new()
    }
}

const TURN_TIMEOUT: Duration = Duration::from_secs(35);
const MEETING_REPLY_MAX: usize = 360;
const SEAT_COUNT: usize = 6;

impl MeetingEngine {
    pub fn new() -> Self {
        Self { in_flight: DashMap::new() }
    }

    /// Run one round of the planned-approval or review-consensus meeting
    /// for `task`. Returns `None` if a meeting for this key is already in
    /// flight (silent no-op per spec) or if the participant set collapses
    /// to zero leaders (short-circuits to approval).
    pub async fn run_round(
        &self,
        db: &Database,
        bus: &Arc<EventBus>,
        project_dir: &Path,
        logs_dir: &Path,
        kind: MeetingKind,
        task_id: &str,
        task_title: &str,
        task_text_for_locale: &str,
        primary_department_id: &str,
        mentioned_department_ids: &[&str],
    ) -> Result<Option<MeetingOutcome>, DbError> {
        let key = kind.guard_key(task_id);
        if self.in_flight.insert(key.clone(), ()).is_some() {
            return Ok(None);
        }
        let result = self
            .run_round_inner(
                db,
                bus,
                project_dir,
                logs_dir,
                kind,
                task_id,
                task_title,
                task_text_for_locale,
                primary_department_id,
                mentioned_department_ids,
            )
            .await;
        self.in_flight.remove(&key);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_round_inner(
        &self,
        db: &Database,
        bus: &Arc<EventBus>,
        project_dir: &Path,
        logs_dir: &Path,
        kind: MeetingKind,
        task_id: &str,
        task_title: &str,
        task_text_for_locale: &str,
        primary_department_id: &str,
        mentioned_department_ids: &[&str],
    ) -> Result<Option<MeetingOutcome>, DbError> {
        let locale = resolve_locale(task_text_for_locale, queries::get_setting(db, "language")?.as_deref());

        let mut leaders = self.gather_leaders(db, primary_department_id, mentioned_department_ids)?;
        if leaders.len() < 2 {
            leaders = self.all_active_team_leaders(db)?;
        }
        if leaders.is_empty() {
            return Ok(Some(MeetingOutcome { needs_revision: false, revise_owner: None }));
        }

        let facilitator = leaders.remove(0);
        let round = queries::latest_meeting_round(db, task_id, kind.db_type())? + 1;

        let meeting_id = uuid::Uuid::new_v4().to_string();
        queries::insert_meeting(
            db,
            &MeetingMinutesRow {
                id: meeting_id.clone(),
                task_id: task_id.to_string(),
                meeting_type: kind.db_type().to_string(),
                round,
                title: format!("{} round {round}", kind.db_type()),
                status: "in_progress".to_string(),
                started_at: chrono::Utc::now().to_rfc3339(),
                completed_at: None,
            },
        )?;

        self.summon(bus, task_id, &facilitator, &leaders);

        let mut transcript: Vec<(String, String)> = Vec::new();
        let mut seq = 0i64;

        let opening = self
            .run_turn(
                db,
                bus,
                project_dir,
                logs_dir,
                &meeting_id,
                &mut seq,
                task_id,
                task_title,
                round,
                &facilitator,
                locale,
                TurnKind::Opening,
                None,
                &transcript,
            )
            .await?;
        transcript.push((leader_label(&facilitator), opening));
        self.pace().await;

        let mut needs_revision = false;
        let mut revise_owner: Option<String> = None;

        for leader in &leaders {
            let reply = self
                .run_turn(
                    db,
                    bus,
                    project_dir,
                    logs_dir,
                    &meeting_id,
                    &mut seq,
                    task_id,
                    task_title,
                    round,
                    leader,
                    locale,
                    TurnKind::Feedback,
                    None,
                    &transcript,
                )
                .await?;
            if !needs_revision && contains_revision_signal(&reply) {
                needs_revision = true;
                revise_owner = Some(leader.id.clone());
            }
            transcript.push((leader_label(leader), reply));
            self.pace().await;
        }

        let summary_stance = if needs_revision { "revision plan" } else { "final-approval request" };
        let summary = self
            .run_turn(
                db,
                bus,
                project_dir,
                logs_dir,
                &meeting_id,
                &mut seq,
                task_id,
                task_title,
                round,
                &facilitator,
                locale,
                TurnKind::Summary,
                Some(summary_stance),
                &transcript,
            )
            .await?;
        transcript.push((leader_label(&facilitator), summary));
        self.pace().await;

        for leader in &leaders {
            let is_revise_owner = revise_owner.as_deref() == Some(leader.id.as_str());
            let stance = if is_revise_owner {
                "hold approval"
            } else if needs_revision {
                "agree with conditional approval"
            } else {
                "approve now"
            };
            let reply = self
                .run_turn(
                    db,
                    bus,
                    project_dir,
                    logs_dir,
                    &meeting_id,
                    &mut seq,
                    task_id,
                    task_title,
                    round,
                    leader,
                    locale,
                    TurnKind::Approval,
                    Some(stance),
                    &transcript,
                )
                .await?;
            transcript.push((leader_label(leader), reply));
            self.pace().await;
        }

        let status = if needs_revision { "revision_requested" } else { "completed" };
        queries::update_meeting_status(db, &meeting_id, status, !needs_revision)?;

        Ok(Some(MeetingOutcome { needs_revision, revise_owner }))
    }

    fn gather_leaders(
        &self,
        db: &Database,
        primary_department_id: &str,
        mentioned_department_ids: &[&str],
    ) -> Result<Vec<AgentRow>, DbError> {
        let mut dept_ids: Vec<String> = vec![primary_department_id.to_string()];
        for d in mentioned_department_ids {
            if !dept_ids.iter().any(|existing| existing == d) {
                dept_ids.push(d.to_string());
            }
        }
        let mut leaders = Vec::new();
        for dept_id in dept_ids {
            if let Some(leader) = queries::get_department_leader(db, &dept_id)? {
                leaders.push(leader);
            }
        }
        Ok(leaders)
    }

    fn all_active_team_leaders(&self, db: &Database) -> Result<Vec<AgentRow>, DbError> {
        let mut leaders = Vec::new();
        for dept in DEPARTMENTS {
            if let Some(leader) = queries::get_department_leader(db, dept.id)? {
                if leader.status != "offline" {
                    leaders.push(leader);
                }
            }
        }
        Ok(leaders)
    }

    fn summon(&self, bus: &Arc<EventBus>, task_id: &str, facilitator: &AgentRow, others: &[AgentRow]) {
        for (seat, leader) in std::iter::once(facilitator).chain(others.iter()).enumerate().take(SEAT_COUNT) {
            bus.emit(
                event_types::EVENT_CEO_OFFICE_CALL,
                Some(task_id.to_string()),
                serde_json::json!({
                    "action": "arrive",
                    "seat": seat,
                    "agentId": leader.id,
                    "meetingFor": task_id,
                }),
            );
        }
    }

    async fn pace(&self) {
        let millis = rand::thread_rng().gen_range(420..=1300);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        db: &Database,
        bus: &Arc<EventBus>,
        project_dir: &Path,
        logs_dir: &Path,
        meeting_id: &str,
        seq: &mut i64,
        task_id: &str,
        task_title: &str,
        round: i64,
        speaker: &AgentRow,
        locale: Locale,
        turn: TurnKind,
        stance_hint: Option<&str>,
        transcript: &[(String, String)],
    ) -> Result<String, DbError> {
        let prompt = build_meeting_prompt(task_title, round, speaker, locale, turn, stance_hint, transcript);
        let provider = speaker.cli_provider.as_deref().unwrap_or("claude");
        let run_id = format!("meeting-{meeting_id}-{seq}");

        let output = child_runner::run_one_shot(
            provider,
            None,
            None,
            project_dir,
            &prompt,
            TURN_TIMEOUT,
            logs_dir,
            &run_id,
            Some(task_id),
            Some(bus),
        )
        .await
        .map(|o| (o.captured, o.timed_out))
        .unwrap_or_else(|_| (String::new(), true));

        let (raw, timed_out) = output;
        let sanitized = sanitize_reply(&raw, timed_out, locale, turn, MEETING_REPLY_MAX);

        *seq += 1;
        queries::insert_meeting_entry(
            db,
            &MeetingMinuteEntryRow {
                id: 0,
                meeting_id: meeting_id.to_string(),
                seq: *seq,
                speaker_agent_id: Some(speaker.id.clone()),
                speaker_name: speaker.name.clone(),
                speaker_department: speaker.department_id.clone(),
                speaker_role: Some(speaker.role.clone()),
                message_type: turn_label(turn).to_string(),
                content: sanitized.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;

        bus.emit(
            event_types::EVENT_CEO_OFFICE_CALL,
            Some(task_id.to_string()),
            serde_json::json!({
                "action": "speak",
                "agentId": speaker.id,
                "line": preview(&sanitized, 96),
            }),
        );
        bus.emit(
            event_types::EVENT_NEW_MESSAGE,
            Some(task_id.to_string()),
            serde_json::json!({ "senderId": speaker.id, "content": sanitized }),
        );

        Ok(sanitized)
    }
}

fn turn_label(turn: TurnKind) -> &'static str {
    match turn {
        TurnKind::Opening => "opening",
        TurnKind::Feedback => "feedback",
        TurnKind::Summary => "summary",
        TurnKind::Approval => "approval",
    }
}

fn leader_label(leader: &AgentRow) -> String {
    format!(
        "{} ({} {})",
        leader.name,
        leader.department_id.clone().unwrap_or_default(),
        leader.role
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Revision-regex scan (§4.7 step 3), implemented as a literal multi-
/// lingual token scan rather than a regex engine — the pattern has no
/// capture groups and a fixed alternation list, so a substring scan is
/// equivalent and avoids adding a `regex` dependency for one fixed list.
const REVISION_TOKENS: &[&str] = &[
    "보완", "수정", "보류", "리스크", "추가 필요", "추가필요", "hold", "revise", "revision",
    "required", "pending", "risk", "block", "保留", "修正", "补充", "暂缓",
];

fn contains_revision_signal(reply: &str) -> bool {
    let lowered = reply.to_lowercase();
    REVISION_TOKENS.iter().any(|token| {
        if token.is_ascii() {
            lowered.contains(token)
        } else {
            reply.contains(token)
        }
    })
}

/// §4.7.1 meeting prompt: label, task context, round, speaker identity, a
/// per-department role constraint, locale instruction, strict output
/// rules, the turn's objective, an optional stance hint, and the numbered
/// transcript so far.
fn build_meeting_prompt(
    task_title: &str,
    round: i64,
    speaker: &AgentRow,
    locale: Locale,
    turn: TurnKind,
    stance_hint: Option<&str>,
    transcript: &[(String, String)],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("[Team Leader Meeting] Task: {task_title}\n"));
    out.push_str(&format!("Round {round}. You are {} — {}.\n", speaker.name, leader_label(speaker)));
    out.push_str(&format!("{}\n", role_constraint(speaker.department_id.as_deref().unwrap_or(""))));
    out.push_str(&format!("{}\n", locale.language_instruction()));
    out.push_str(
        "Respond with exactly one natural chat message: no JSON, no markdown, 1-3 sentences, \
         with an explicit actionable stance.\n",
    );
    out.push_str(&format!("Your objective this turn: {}.\n", turn_objective(turn)));
    if let Some(hint) = stance_hint {
        out.push_str(&format!("Stance to take: {hint}.\n"));
    }
    if !transcript.is_empty() {
        out.push_str("Transcript so far:\n");
        for (idx, (speaker, content)) in transcript.iter().enumerate() {
            out.push_str(&format!("{}. {speaker}: {content}\n", idx + 1));
        }
    }
    out
}

pub fn role_constraint(department_id: &str) -> &'static str {
    match department_id {
        "qa" => "As QA you may flag risks and request verification but must not write production code yourself.",
        "design" => "As Design you speak to UX/UI concerns, not backend implementation detail.",
        "devsecops" => "As DevSecOps you speak to security and pipeline risk, not feature scope.",
        "operations" => "As Operations you speak to rollout, support, and customer impact.",
        "development" => "As Development you speak to implementation feasibility and technical risk.",
        _ => "Stay within your department's domain of responsibility.",
    }
}

fn turn_objective(turn: TurnKind) -> &'static str {
    match turn {
        TurnKind::Opening => "open the meeting and frame the task for the team",
        TurnKind::Feedback => "give feedback, raising any concerns or risks",
        TurnKind::Summary => "summarize the discussion and state the path forward",
        TurnKind::Approval => "state your approval stance clearly",
    }
}

/// §4.7.2 reply sanitization: pretty-print, strip markers/tool-call
/// brackets/code/backticks/meta-narration, collapse whitespace, dedupe
/// sentences (cap at two), truncate, and fall back to a canned localized
/// reply when the result is empty, timed out, reads as narration, or is
/// English against a non-English locale.
fn sanitize_reply(raw: &str, timed_out: bool, locale: Locale, turn: TurnKind, max_chars: usize) -> String {
    if timed_out {
        return canned_reply(locale, turn);
    }

    let pretty = pretty_print(raw);
    let stripped = strip_markers(&pretty);
    let collapsed = collapse_whitespace(&stripped);
    let deduped = dedupe_sentences(&collapsed, 2);
    let truncated: String = deduped.chars().take(max_chars).collect();

    if truncated.trim().is_empty() || reads_as_narration(&truncated) {
        return canned_reply(locale, turn);
    }
    if locale != Locale::En && is_mostly_ascii_letters(&truncated) && truncated.chars().count() > 20 {
        return canned_reply(locale, turn);
    }

    truncated
}

fn strip_markers(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let is_marker = trimmed.starts_with("[thread]")
            || trimmed.starts_with("[usage]")
            || trimmed.starts_with("[tool")
            || trimmed.starts_with("[reasoning]")
            || trimmed.starts_with("[spawn_agent]")
            || trimmed.starts_with("[agent_done]")
            || trimmed.starts_with("[result:")
            || trimmed.starts_with("```")
            || trimmed.starts_with('$')
            || trimmed.starts_with('>');
        if is_marker {
            continue;
        }
        out.push_str(line);
        out.push(' ');
    }
    out.replace('`', "")
}

const NARRATION_VERBS: &[&str] = &[
    "I need to analyze",
    "Let me check",
    "I will now",
    "Let me look at",
    "I'm going to",
];

fn reads_as_narration(text: &str) -> bool {
    NARRATION_VERBS.iter().any(|v| text.contains(v))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn dedupe_sentences(text: &str, max_sentences: usize) -> String {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for sentence in text.split(['.', '!', '?']) {
        let trimmed = sentence.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = trimmed.to_lowercase();
        if seen.insert(key) {
            kept.push(trimmed.to_string());
            if kept.len() >= max_sentences {
                break;
            }
        }
    }
    if kept.is_empty() {
        text.to_string()
    } else {
        format!("{}.", kept.join(". "))
    }
}

fn is_mostly_ascii_letters(text: &str) -> bool {
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    if letters == 0 {
        return false;
    }
    let ascii_letters = text.chars().filter(|c| c.is_ascii_alphabetic()).count();
    ascii_letters as f64 / letters as f64 > 0.8
}

fn canned_reply(locale: Locale, turn: TurnKind) -> String {
    let (en, ko, ja, zh) = match turn {
        TurnKind::Opening => (
            "Kickoff noted, let's proceed.",
            "킥오프 확인했습니다, 진행하겠습니다.",
            "キックオフを確認しました、進めます。",
            "已确认启动，开始推进。",
        ),
        TurnKind::Feedback => (
            "Feedback acknowledged, no blocking concerns from me.",
            "피드백 확인했습니다, 막는 이슈는 없습니다.",
            "フィードバックを確認しました、ブロッカーはありません。",
            "已确认反馈，没有阻塞性问题。",
        ),
        TurnKind::Summary => (
            "I will consolidate the feedback and move us forward.",
            "피드백을 정리해서 진행하겠습니다.",
            "フィードバックを整理して進めます。",
            "我会整理反馈并继续推进。",
        ),
        TurnKind::Approval => (
            "Approve now.",
            "지금 승인합니다.",
            "今承認します。",
            "现在批准。",
        ),
    };
    match locale {
        Locale::En => en.to_string(),
        Locale::Ko => ko.to_string(),
        Locale::Ja => ja.to_string(),
        Locale::Zh => zh.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_signal_detects_korean_and_english_tokens() {
        assert!(contains_revision_signal("보완 필요합니다"));
        assert!(contains_revision_signal("this needs revision before we ship"));
        assert!(!contains_revision_signal("looks good to me, approve now"));
    }

    #[test]
    fn sanitize_falls_back_to_canned_reply_on_timeout() {
        let reply = sanitize_reply("", true, Locale::En, TurnKind::Approval, 420);
        assert_eq!(reply, "Approve now.");
    }

    #[test]
    fn sanitize_strips_tool_markers_and_collapses_whitespace() {
        let raw = "[tool: shell] ls\nLooks solid,   ship it.";
        let out = sanitize_reply(raw, false, Locale::En, TurnKind::Feedback, 420);
        assert_eq!(out, "Looks solid, ship it.");
    }

    #[test]
    fn sanitize_falls_back_when_english_reply_targets_korean_locale() {
        let raw = "This is a fairly long English sentence that should not pass through as Korean output.";
        let out = sanitize_reply(raw, false, Locale::Ko, TurnKind::Approval, 420);
        assert_eq!(out, "지금 승인합니다.");
    }

    #[test]
    fn dedupe_sentences_caps_at_two_and_drops_repeats() {
        let text = "Ship it. Ship it. Looks good. One more thing.";
        let out = dedupe_sentences(text, 2);
        assert_eq!(out, "Ship it. Looks good.");
    }
}
