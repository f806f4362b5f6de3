//! Rule-engine facing compliance API
//!
//! `ComplianceRecorder` is the seam the rule engine depends on. Implementors
//! provide the generic emission path and rule-evaluation recording; every
//! framework helper is a default method that fixes its control and delegates
//! to `emit_compliance_evidence`.

use crate::details;
use crate::emitter::EnqueueOutcome;
use crate::evidence::Details;
use crate::metrics::{EvaluationResult, Severity};
use crate::taxonomy::{
    ComplianceControl, FEDRAMP_AC_3, FEDRAMP_AU_2, GDPR_ART_15, GDPR_ART_17, GDPR_ART_7,
    HIPAA_164_312_A_2_IV, HIPAA_164_312_B, SOC2_CC6_1, SOC2_CC6_3,
};

/// Outcome of a violation record
pub const VIOLATION_OUTCOME: &str = "violation";

fn decision(granted: bool) -> &'static str {
    if granted {
        "granted"
    } else {
        "denied"
    }
}

/// Compliance evidence and rule-evaluation recording
pub trait ComplianceRecorder: Send + Sync {
    /// Enqueue evidence for a control; never blocks
    fn emit_compliance_evidence(
        &self,
        control: &ComplianceControl,
        outcome: &str,
        details: Details,
    ) -> EnqueueOutcome;

    /// Record one rule evaluation on every metrics backend
    fn record_rule_evaluation(&self, rule_id: &str, result: EvaluationResult, duration_seconds: f64);

    /// Record a detected violation metric
    fn record_violation(&self, control: &ComplianceControl, severity: Severity);

    /// SOC2 CC6.1: an authorization decision
    fn soc2_access_control(&self, user_id: &str, resource: &str, granted: bool) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &SOC2_CC6_1,
            decision(granted),
            details! {
                "user_id" => user_id,
                "resource" => resource,
                "granted" => granted,
            },
        )
    }

    /// SOC2 CC6.3: a tenant isolation check
    fn soc2_data_isolation(&self, tenant_id: &str, operation: &str, isolated: bool) -> EnqueueOutcome {
        let outcome = if isolated { "isolated" } else { "violation" };
        self.emit_compliance_evidence(
            &SOC2_CC6_3,
            outcome,
            details! {
                "tenant_id" => tenant_id,
                "operation" => operation,
                "isolated" => isolated,
            },
        )
    }

    /// HIPAA 164.312(b): access to protected health information
    fn hipaa_access_log(&self, user_id: &str, action: &str, phi_type: &str) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &HIPAA_164_312_B,
            "logged",
            details! {
                "user_id" => user_id,
                "action" => action,
                "phi_type" => phi_type,
            },
        )
    }

    /// HIPAA 164.312(a)(2)(iv): an encryption or decryption operation
    fn hipaa_encryption(&self, operation: &str, data_type: &str, encrypted: bool) -> EnqueueOutcome {
        let outcome = if encrypted { "success" } else { "failure" };
        self.emit_compliance_evidence(
            &HIPAA_164_312_A_2_IV,
            outcome,
            details! {
                "operation" => operation,
                "data_type" => data_type,
                "encrypted" => encrypted,
            },
        )
    }

    /// GDPR Art. 15: a data subject access request
    fn gdpr_data_access(&self, data_subject_id: &str, request_type: &str, granted: bool) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &GDPR_ART_15,
            decision(granted),
            details! {
                "data_subject_id" => data_subject_id,
                "request_type" => request_type,
                "granted" => granted,
            },
        )
    }

    /// GDPR Art. 17: an erasure request; `status` is the outcome
    fn gdpr_data_deletion(&self, data_subject_id: &str, status: &str) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &GDPR_ART_17,
            status,
            details! {
                "data_subject_id" => data_subject_id,
                "status" => status,
            },
        )
    }

    /// GDPR Art. 7: consent given or withdrawn; `action` is the outcome
    fn gdpr_consent(&self, data_subject_id: &str, action: &str, purpose: &str) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &GDPR_ART_7,
            action,
            details! {
                "data_subject_id" => data_subject_id,
                "action" => action,
                "purpose" => purpose,
            },
        )
    }

    /// FedRAMP AU-2: an auditable event
    fn fedramp_audit_event(&self, event_type: &str, user_id: &str, action: &str) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &FEDRAMP_AU_2,
            "recorded",
            details! {
                "event_type" => event_type,
                "user_id" => user_id,
                "action" => action,
            },
        )
    }

    /// FedRAMP AC-3: an access enforcement decision
    fn fedramp_access_control(&self, user_id: &str, resource: &str, granted: bool) -> EnqueueOutcome {
        self.emit_compliance_evidence(
            &FEDRAMP_AC_3,
            decision(granted),
            details! {
                "user_id" => user_id,
                "resource" => resource,
                "granted" => granted,
            },
        )
    }

    /// Record a violation metric and enqueue evidence of it
    fn detect_violation(&self, control: &ComplianceControl, severity: Severity, reason: &str) -> EnqueueOutcome {
        self.record_violation(control, severity);
        self.emit_compliance_evidence(
            control,
            VIOLATION_OUTCOME,
            details! {
                "severity" => severity.as_str(),
                "reason" => reason,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceValue;
    use crate::taxonomy::FEDRAMP_CM_2;
    use std::sync::Mutex;

    type Emitted = (ComplianceControl, String, Details);

    #[derive(Default)]
    struct Capture {
        emitted: Mutex<Vec<Emitted>>,
        violations: Mutex<Vec<(ComplianceControl, Severity)>>,
    }

    impl ComplianceRecorder for Capture {
        fn emit_compliance_evidence(
            &self,
            control: &ComplianceControl,
            outcome: &str,
            details: Details,
        ) -> EnqueueOutcome {
            self.emitted
                .lock()
                .unwrap()
                .push((*control, outcome.to_string(), details));
            EnqueueOutcome::Accepted
        }

        fn record_rule_evaluation(&self, _rule_id: &str, _result: EvaluationResult, _duration_seconds: f64) {}

        fn record_violation(&self, control: &ComplianceControl, severity: Severity) {
            self.violations.lock().unwrap().push((*control, severity));
        }
    }

    impl Capture {
        fn last(&self) -> Emitted {
            self.emitted.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[test]
    fn test_soc2_access_control() {
        let capture = Capture::default();
        capture.soc2_access_control("u1", "/api/rules", false);

        let (control, outcome, details) = capture.last();
        assert_eq!(control, SOC2_CC6_1);
        assert_eq!(outcome, "denied");
        assert_eq!(details["user_id"], EvidenceValue::from("u1"));
        assert_eq!(details["granted"], EvidenceValue::Bool(false));
        assert!(!details.contains_key("timestamp"));
    }

    #[test]
    fn test_outcome_mapping() {
        let capture = Capture::default();
        capture.soc2_data_isolation("t1", "read", false);
        assert_eq!(capture.last().1, "violation");

        capture.hipaa_encryption("encrypt", "phi", true);
        assert_eq!(capture.last().0, HIPAA_164_312_A_2_IV);
        assert_eq!(capture.last().1, "success");

        capture.hipaa_access_log("u1", "view", "lab_results");
        assert_eq!(capture.last().1, "logged");

        capture.gdpr_data_access("ds1", "export", true);
        assert_eq!(capture.last().1, "granted");

        capture.gdpr_data_deletion("ds1", "completed");
        assert_eq!(capture.last().1, "completed");

        capture.gdpr_consent("ds1", "withdrawn", "marketing");
        assert_eq!(capture.last().1, "withdrawn");

        capture.fedramp_audit_event("login", "u1", "authenticate");
        assert_eq!(capture.last().1, "recorded");

        capture.fedramp_access_control("u1", "/admin", true);
        assert_eq!(capture.last().1, "granted");

        assert_eq!(capture.emitted.lock().unwrap().len(), 8);
    }

    #[test]
    fn test_detect_violation() {
        let capture = Capture::default();
        capture.detect_violation(&FEDRAMP_CM_2, Severity::Critical, "baseline drift");

        let (control, outcome, details) = capture.last();
        assert_eq!(control, FEDRAMP_CM_2);
        assert_eq!(outcome, VIOLATION_OUTCOME);
        assert_eq!(details["severity"], EvidenceValue::from("critical"));
        assert_eq!(details["reason"], EvidenceValue::from("baseline drift"));
        assert_eq!(
            capture.violations.lock().unwrap().as_slice(),
            &[(FEDRAMP_CM_2, Severity::Critical)]
        );
    }
}
