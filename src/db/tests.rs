//! Database operations unit tests

#[cfg(test)]
mod tests {
    use crate::db::{queries, Database};
    use uuid::Uuid;

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    #[test]
    fn seeding_creates_six_departments_and_leaders() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let depts = queries::list_departments(&db).unwrap();
        assert_eq!(depts.len(), 6);
        assert_eq!(depts[0].id, "planning");
        assert_eq!(depts[0].agent_count, 1);

        let agents = queries::list_agents(&db).unwrap();
        assert_eq!(agents.len(), 6);
        assert!(agents.iter().all(|a| a.role == "team_leader"));
    }

    #[test]
    fn reseeding_an_already_seeded_db_is_a_no_op() {
        let db = Database::open_in_memory().expect("in-memory DB");
        queries::seed_departments_and_agents(&db).unwrap();
        queries::seed_departments_and_agents(&db).unwrap();
        assert_eq!(queries::list_departments(&db).unwrap().len(), 6);
        assert_eq!(queries::list_agents(&db).unwrap().len(), 6);
    }

    #[test]
    fn task_cascade_delete_cleans_messages() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let task_id = Uuid::new_v4().to_string();
        let ts = now();

        queries::insert_task(
            &db,
            &queries::TaskRow {
                id: task_id.clone(),
                title: "Add CHANGELOG entry".to_string(),
                description: None,
                department_id: Some("development".to_string()),
                assigned_agent_id: None,
                status: "inbox".to_string(),
                priority: 0,
                task_type: None,
                project_path: Some("/tmp/project".to_string()),
                result: None,
                started_at: None,
                completed_at: None,
                created_at: ts.clone(),
                updated_at: ts.clone(),
            },
        )
        .unwrap();

        queries::insert_message(
            &db,
            &queries::MessageRow {
                id: Uuid::new_v4().to_string(),
                sender_type: "ceo".to_string(),
                sender_id: None,
                receiver_type: "agent".to_string(),
                receiver_id: Some("development-lead".to_string()),
                content: "please start".to_string(),
                message_type: "chat".to_string(),
                task_id: Some(task_id.clone()),
                created_at: ts.clone(),
            },
        )
        .unwrap();

        queries::delete_task(&db, &task_id).unwrap();
        assert!(queries::get_task(&db, &task_id).unwrap().is_none());
        let remaining = queries::list_messages(&db, &queries::MessageFilter::default()).unwrap();
        assert!(remaining.iter().all(|m| m.task_id.as_deref() != Some(task_id.as_str())));
    }

    #[test]
    fn subtask_status_updates_and_auto_completes_local() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let task_id = Uuid::new_v4().to_string();
        let ts = now();

        queries::insert_task(
            &db,
            &queries::TaskRow {
                id: task_id.clone(),
                title: "Ship feature".to_string(),
                description: None,
                department_id: Some("development".to_string()),
                assigned_agent_id: None,
                status: "in_progress".to_string(),
                priority: 0,
                task_type: None,
                project_path: None,
                result: None,
                started_at: None,
                completed_at: None,
                created_at: ts.clone(),
                updated_at: ts.clone(),
            },
        )
        .unwrap();

        let local_subtask = Uuid::new_v4().to_string();
        queries::insert_subtask(
            &db,
            &queries::SubtaskRow {
                id: local_subtask.clone(),
                task_id: task_id.clone(),
                title: "implement handler".to_string(),
                description: None,
                status: "in_progress".to_string(),
                assigned_agent_id: None,
                blocked_reason: None,
                cli_tool_use_id: None,
                target_department_id: None,
                delegated_task_id: None,
                created_at: ts.clone(),
                updated_at: ts.clone(),
            },
        )
        .unwrap();

        let cross_dept_subtask = Uuid::new_v4().to_string();
        queries::insert_subtask(
            &db,
            &queries::SubtaskRow {
                id: cross_dept_subtask.clone(),
                task_id: task_id.clone(),
                title: "design mockup".to_string(),
                description: None,
                status: "pending".to_string(),
                assigned_agent_id: None,
                blocked_reason: None,
                cli_tool_use_id: None,
                target_department_id: Some("design".to_string()),
                delegated_task_id: None,
                created_at: ts.clone(),
                updated_at: ts,
            },
        )
        .unwrap();

        assert!(!queries::subtasks_all_done(&db, &task_id).unwrap());

        let touched = queries::auto_complete_local_subtasks(&db, &task_id).unwrap();
        assert_eq!(touched, 1);
        assert_eq!(
            queries::get_subtask(&db, &local_subtask).unwrap().unwrap().status,
            "done"
        );
        assert!(!queries::subtasks_all_done(&db, &task_id).unwrap());

        queries::update_subtask_status(&db, &cross_dept_subtask, "done", None).unwrap();
        assert!(queries::subtasks_all_done(&db, &task_id).unwrap());
    }

    #[test]
    fn pick_best_subordinate_prefers_idle_then_seniority() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let ts = now();

        for (id, status, role) in [
            ("dev-senior-working", "working", "senior"),
            ("dev-junior-idle", "idle", "junior"),
            ("dev-intern-idle", "idle", "intern"),
        ] {
            queries::insert_agent(
                &db,
                &queries::AgentRow {
                    id: id.to_string(),
                    name: id.to_string(),
                    name_ko: id.to_string(),
                    department_id: Some("development".to_string()),
                    role: role.to_string(),
                    cli_provider: Some("claude".to_string()),
                    status: status.to_string(),
                    current_task_id: None,
                    avatar_emoji: None,
                    personality: None,
                    stats_tasks_done: 0,
                    stats_xp: 0,
                    created_at: ts.clone(),
                    updated_at: ts.clone(),
                },
            )
            .unwrap();
        }

        let picked = queries::pick_best_subordinate(&db, "development", "development-lead")
            .unwrap()
            .expect("a subordinate");
        assert_eq!(picked.id, "dev-junior-idle");
    }

    #[test]
    fn oauth_state_roundtrips_and_enforces_ttl() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let state_id = Uuid::new_v4().to_string();

        queries::insert_oauth_state(
            &db,
            &queries::OAuthStateRow {
                id: state_id.clone(),
                provider: "github".to_string(),
                verifier: "device-code-abc".to_string(),
                redirect_to: None,
                created_at: now(),
            },
        )
        .unwrap();

        let consumed = queries::consume_oauth_state(&db, &state_id, "github").unwrap();
        assert_eq!(consumed.unwrap().verifier, "device-code-abc");

        // Second consume finds nothing: the row was deleted on first read.
        let gone = queries::consume_oauth_state(&db, &state_id, "github").unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn oauth_state_expired_by_ttl_is_rejected() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let state_id = Uuid::new_v4().to_string();
        let stale = chrono::Utc::now() - chrono::Duration::minutes(11);

        queries::insert_oauth_state(
            &db,
            &queries::OAuthStateRow {
                id: state_id.clone(),
                provider: "google".to_string(),
                verifier: "verifier-xyz".to_string(),
                redirect_to: Some("/settings".to_string()),
                created_at: stale.to_rfc3339(),
            },
        )
        .unwrap();

        let consumed = queries::consume_oauth_state(&db, &state_id, "google").unwrap();
        assert!(consumed.is_none());
    }

    #[test]
    fn meeting_with_entries_preserves_seq_order() {
        let db = Database::open_in_memory().expect("in-memory DB");
        let task_id = Uuid::new_v4().to_string();
        let meeting_id = Uuid::new_v4().to_string();
        let ts = now();

        queries::insert_task(
            &db,
            &queries::TaskRow {
                id: task_id.clone(),
                title: "Plan sprint".to_string(),
                description: None,
                department_id: Some("planning".to_string()),
                assigned_agent_id: None,
                status: "in_progress".to_string(),
                priority: 0,
                task_type: None,
                project_path: None,
                result: None,
                started_at: None,
                completed_at: None,
                created_at: ts.clone(),
                updated_at: ts.clone(),
            },
        )
        .unwrap();

        queries::insert_meeting(
            &db,
            &queries::MeetingMinutesRow {
                id: meeting_id.clone(),
                task_id: task_id.clone(),
                meeting_type: "kickoff".to_string(),
                round: 1,
                title: "Sprint kickoff".to_string(),
                status: "in_progress".to_string(),
                started_at: ts.clone(),
                completed_at: None,
            },
        )
        .unwrap();

        for seq in 0..3 {
            queries::insert_meeting_entry(
                &db,
                &queries::MeetingMinuteEntryRow {
                    id: 0,
                    meeting_id: meeting_id.clone(),
                    seq,
                    speaker_agent_id: None,
                    speaker_name: format!("speaker-{seq}"),
                    speaker_department: None,
                    speaker_role: None,
                    message_type: "statement".to_string(),
                    content: format!("turn {seq}"),
                    created_at: ts.clone(),
                },
            )
            .unwrap();
        }

        let full = queries::get_meeting_with_entries(&db, &meeting_id).unwrap().unwrap();
        assert_eq!(full.entries.len(), 3);
        assert_eq!(full.entries[0].content, "turn 0");
        assert_eq!(full.entries[2].content, "turn 2");
    }

    #[test]
    fn settings_upsert_overwrites_value() {
        let db = Database::open_in_memory().expect("in-memory DB");
        queries::set_setting(&db, "language", "en").unwrap();
        queries::set_setting(&db, "language", "ko").unwrap();
        assert_eq!(queries::get_setting(&db, "language").unwrap().as_deref(), Some("ko"));
    }
}
