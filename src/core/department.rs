//! The six fixed departments of the virtual company and the keyword lists
//! the Delegation Engine uses to detect which departments a CEO message
//! mentions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TeamLeader,
    Senior,
    Junior,
    Intern,
}

impl Role {
    /// Seniority ordering used by internal-delegation subordinate picking:
    /// higher is preferred.
    pub fn seniority_rank(self) -> u8 {
        match self {
            Role::Senior => 2,
            Role::Junior => 1,
            Role::Intern => 0,
            Role::TeamLeader => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::TeamLeader => "team_leader",
            Role::Senior => "senior",
            Role::Junior => "junior",
            Role::Intern => "intern",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team_leader" => Ok(Role::TeamLeader),
            "senior" => Ok(Role::Senior),
            "junior" => Ok(Role::Junior),
            "intern" => Ok(Role::Intern),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

pub struct Department {
    pub id: &'static str,
    pub name: &'static str,
    pub name_ko: &'static str,
    pub icon: &'static str,
    pub color: &'static str,
    pub sort_order: i64,
}

/// The workflow-ordered department roster seeded on first boot.
pub const DEPARTMENTS: &[Department] = &[
    Department {
        id: "planning",
        name: "Planning",
        name_ko: "기획팀",
        icon: "clipboard",
        color: "#6366f1",
        sort_order: 0,
    },
    Department {
        id: "development",
        name: "Development",
        name_ko: "개발팀",
        icon: "code",
        color: "#22c55e",
        sort_order: 1,
    },
    Department {
        id: "design",
        name: "Design",
        name_ko: "디자인팀",
        icon: "palette",
        color: "#ec4899",
        sort_order: 2,
    },
    Department {
        id: "qa",
        name: "QA",
        name_ko: "QA팀",
        icon: "check-circle",
        color: "#f59e0b",
        sort_order: 3,
    },
    Department {
        id: "devsecops",
        name: "DevSecOps",
        name_ko: "데브섹옵스팀",
        icon: "shield",
        color: "#ef4444",
        sort_order: 4,
    },
    Department {
        id: "operations",
        name: "Operations",
        name_ko: "운영팀",
        icon: "settings",
        color: "#64748b",
        sort_order: 5,
    },
];

/// Keyword lists used by the department-keyword scan (§4.9). Deliberately a
/// fixed multi-lingual union, not per-language branches, matching the
/// revision-regex design note in §9.
pub const DEPT_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "planning",
        &[
            "기획", "일정", "요구사항", "로드맵", "plan", "schedule", "requirement", "roadmap",
            "스펙",
        ],
    ),
    (
        "design",
        &[
            "디자인", "목업", "시안", "와이어프레임", "UI", "UX", "design", "mockup", "wireframe",
            "prototype", "브랜딩",
        ],
    ),
    (
        "qa",
        &[
            "QA", "테스트 계획", "품질", "검증", "회귀", "test plan", "quality", "regression",
            "verification",
        ],
    ),
    (
        "development",
        &[
            "개발", "코딩", "백엔드", "프론트엔드", "API", "서버", "코드", "버그", "테스트 코드",
            "배포", "develop", "backend", "frontend", "code", "bug", "server", "implementation",
        ],
    ),
    (
        "devsecops",
        &[
            "보안", "취약점", "인프라", "CI/CD", "파이프라인", "security", "vulnerability",
            "infra", "pipeline", "monitoring", "모니터링",
        ],
    ),
    (
        "operations",
        &[
            "운영", "고객", "마케팅", "릴리즈 공지", "operations", "customer", "marketing",
            "release note", "support",
        ],
    ),
];

/// Scan `text` for department keywords, excluding `own_department_id`.
/// Returns department ids in DEPT_KEYWORDS order (the order the
/// cross-department queue processes them in).
pub fn scan_mentioned_departments(text: &str, own_department_id: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    DEPT_KEYWORDS
        .iter()
        .filter(|(dept, _)| *dept != own_department_id)
        .filter(|(_, keywords)| {
            keywords
                .iter()
                .any(|kw| text.contains(kw) || lowered.contains(&kw.to_lowercase()))
        })
        .map(|(dept, _)| *dept)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_korean_and_english_keywords() {
        let mentions = scan_mentioned_departments(
            "디자인 시안과 QA 테스트 계획을 받아서 개발 배포 준비",
            "planning",
        );
        assert_eq!(mentions, vec!["design", "qa", "development"]);
    }

    #[test]
    fn excludes_own_department() {
        let mentions = scan_mentioned_departments("need backend code review", "development");
        assert!(!mentions.contains(&"development"));
    }

    #[test]
    fn no_mentions_returns_empty() {
        assert!(scan_mentioned_departments("say hello to everyone", "planning").is_empty());
    }
}
