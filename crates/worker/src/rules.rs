//! 业务规则
//!
//! 每条规则检查一个负载并可能给出一条发现。`Critical` 级别的发现中止执行，
//! 其他级别作为警告写入执行记录。

use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use orchestrator_core::{OrchestratorError, OrchestratorResult, RulesConfig};
use orchestrator_domain::{Precision, TaskKind, TaskPayload};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RuleSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleSeverity::Low => "LOW",
            RuleSeverity::Medium => "MEDIUM",
            RuleSeverity::High => "HIGH",
            RuleSeverity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFinding {
    pub rule: &'static str,
    pub severity: RuleSeverity,
    pub message: String,
}

impl RuleFinding {
    fn new(rule: &'static str, severity: RuleSeverity, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.severity, self.rule, self.message)
    }
}

pub trait BusinessRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, _kind: TaskKind) -> bool {
        true
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding>;
}

/// 扣款与转账金额必须为正
struct PositiveAmountRule;

impl BusinessRule for PositiveAmountRule {
    fn name(&self) -> &'static str {
        "positive_amount"
    }

    fn applies_to(&self, kind: TaskKind) -> bool {
        kind != TaskKind::BalanceAdjustment
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let amount = payload.amount();
        (amount <= BigDecimal::zero()).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::Critical,
                format!("金额必须大于0，实际为 {amount}"),
            )
        })
    }
}

struct MaxAmountRule {
    limit: BigDecimal,
}

impl BusinessRule for MaxAmountRule {
    fn name(&self) -> &'static str {
        "max_single_amount"
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let amount = payload.amount();
        (amount > self.limit).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::Critical,
                format!("单笔金额 {} 超过上限 {}", amount, self.limit),
            )
        })
    }
}

struct LargeAmountRule {
    threshold: BigDecimal,
}

impl BusinessRule for LargeAmountRule {
    fn name(&self) -> &'static str {
        "large_amount"
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let amount = payload.amount();
        (amount >= self.threshold).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::High,
                format!("大额操作: {} {}", amount, payload.currency()),
            )
        })
    }
}

struct SameAccountTransferRule;

impl BusinessRule for SameAccountTransferRule {
    fn name(&self) -> &'static str {
        "same_account_transfer"
    }

    fn applies_to(&self, kind: TaskKind) -> bool {
        kind == TaskKind::BalanceTransfer
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        match payload {
            TaskPayload::BalanceTransfer(r) if r.from_account == r.to_account => {
                Some(RuleFinding::new(
                    self.name(),
                    RuleSeverity::Critical,
                    format!("转出与转入账户相同: {}", r.from_account),
                ))
            }
            _ => None,
        }
    }
}

struct AllowedCurrencyRule {
    allowed: Vec<String>,
}

impl BusinessRule for AllowedCurrencyRule {
    fn name(&self) -> &'static str {
        "allowed_currency"
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let currency = payload.currency().to_uppercase();
        (!self.allowed.contains(&currency)).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::Critical,
                format!("不支持的币种: {currency}"),
            )
        })
    }
}

/// 按精度舍入后金额为0的操作不产生任何变动
struct EffectiveAmountRule {
    precision: Precision,
}

impl BusinessRule for EffectiveAmountRule {
    fn name(&self) -> &'static str {
        "effective_amount"
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let amount = payload.amount();
        let rounded = self.precision.round(&amount);
        (!amount.is_zero() && rounded.is_zero()).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::Critical,
                format!(
                    "金额 {} 按 {} 位小数舍入后为0",
                    amount,
                    self.precision.decimal_places()
                ),
            )
        })
    }
}

/// 超出精度的金额会被舍入
struct PrecisionRule {
    precision: Precision,
}

impl BusinessRule for PrecisionRule {
    fn name(&self) -> &'static str {
        "precision"
    }

    fn evaluate(&self, payload: &TaskPayload) -> Option<RuleFinding> {
        let amount = payload.amount();
        (!self.precision.is_exact(&amount)).then(|| {
            RuleFinding::new(
                self.name(),
                RuleSeverity::Low,
                format!(
                    "金额 {} 超出 {} 位小数，按 {} 处理",
                    amount,
                    self.precision.decimal_places(),
                    self.precision.round(&amount)
                ),
            )
        })
    }
}

/// 规则引擎
pub struct RuleEngine {
    rules: Vec<Box<dyn BusinessRule>>,
}

impl RuleEngine {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn from_config(config: &RulesConfig, precision: Precision) -> OrchestratorResult<Self> {
        let limit = parse_amount("max_single_amount", &config.max_single_amount)?;
        let threshold = parse_amount("large_amount_warning", &config.large_amount_warning)?;

        let mut engine = Self::empty()
            .with_rule(PositiveAmountRule)
            .with_rule(SameAccountTransferRule)
            .with_rule(MaxAmountRule { limit })
            .with_rule(LargeAmountRule { threshold })
            .with_rule(EffectiveAmountRule { precision })
            .with_rule(PrecisionRule { precision });
        if !config.allowed_currencies.is_empty() {
            engine = engine.with_rule(AllowedCurrencyRule {
                allowed: config
                    .allowed_currencies
                    .iter()
                    .map(|c| c.to_uppercase())
                    .collect(),
            });
        }
        Ok(engine)
    }

    pub fn with_rule<R: BusinessRule + 'static>(mut self, rule: R) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 所有适用规则的发现，按严重程度从高到低
    pub fn findings(&self, payload: &TaskPayload) -> Vec<RuleFinding> {
        let kind = payload.kind();
        let mut findings: Vec<RuleFinding> = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(kind))
            .filter_map(|rule| rule.evaluate(payload))
            .collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        findings
    }

    /// 有 `Critical` 发现时返回 [`OrchestratorError::RuleViolation`]，否则返回警告列表
    pub fn evaluate(&self, payload: &TaskPayload) -> OrchestratorResult<Vec<String>> {
        let findings = self.findings(payload);
        if let Some(critical) = findings
            .iter()
            .find(|f| f.severity == RuleSeverity::Critical)
        {
            return Err(OrchestratorError::rule_violation(
                critical.rule,
                critical.message.clone(),
            ));
        }
        if !findings.is_empty() {
            debug!(count = findings.len(), "业务规则产生警告");
        }
        Ok(findings.iter().map(ToString::to_string).collect())
    }
}

fn parse_amount(field: &str, value: &str) -> OrchestratorResult<BigDecimal> {
    BigDecimal::from_str(value)
        .map_err(|e| OrchestratorError::config_error(format!("{field} 不是有效金额 '{value}': {e}")))
}
