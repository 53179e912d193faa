//! Rendering typed rules for a concrete backend.
//!
//! Renderers only see [`Rule`] values. They never see the policy, so adding a
//! backend cannot change what is admitted.

use super::host::{HostHook, HostRules};
use super::redirect::RedirectionRules;
use super::rule::{Action, Rule, Table};

/// Turns typed rule sets into backend input.
pub trait RuleRenderer {
    /// Backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Text applied inside the execution environment in one transaction.
    fn render_redirection(&self, rules: &RedirectionRules) -> String;

    /// Text applied on the host in one transaction.
    fn render_host(&self, rules: &HostRules) -> String;

    /// Commands that remove a host rule group, in order.
    ///
    /// Each command is an argument vector for the backend's CLI.
    fn render_host_rollback(&self, hook: &HostHook) -> Vec<Vec<String>>;
}

/// Renders `iptables-restore` input.
///
/// Output is meant for `iptables-restore --noflush`, so existing rules (for
/// example Docker's embedded DNS redirection) are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct IptablesRenderer;

impl IptablesRenderer {
    /// Match and target arguments of a rule, without the chain operation.
    pub fn rule_args(rule: &Rule) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(protocol) = rule.protocol {
            args.extend(["-p".to_string(), protocol.to_string()]);
        }
        if let Some(source) = rule.source {
            args.extend(["-s".to_string(), source.to_string()]);
        }
        if let Some(destination) = rule.destination {
            args.extend(["-d".to_string(), destination.to_string()]);
        }
        if let Some(iface) = &rule.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &rule.out_iface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(port) = rule.dport {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        if rule.established {
            args.extend(
                ["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"].map(str::to_string),
            );
        }

        args.push("-j".to_string());
        match &rule.action {
            Action::Accept => args.push("ACCEPT".to_string()),
            Action::Drop => args.push("DROP".to_string()),
            Action::Return => args.push("RETURN".to_string()),
            Action::Dnat(target) => {
                args.extend(["DNAT".to_string(), "--to-destination".to_string(), target.to_string()])
            }
            Action::Log(prefix) => {
                args.extend(["LOG".to_string(), "--log-prefix".to_string(), prefix.clone()])
            }
            Action::Jump(chain) => args.push(chain.clone()),
        }
        args
    }

    fn line(op: &str, rule: &Rule) -> String {
        let mut line = format!("{op} {}", rule.chain);
        for arg in Self::rule_args(rule) {
            line.push(' ');
            line.push_str(&quote(&arg));
        }
        line
    }
}

/// Quote an argument for `iptables-restore` if it needs it.
fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

impl RuleRenderer for IptablesRenderer {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn render_redirection(&self, rules: &RedirectionRules) -> String {
        let mut out = String::new();
        for table in [Table::Nat, Table::Filter] {
            out.push_str(&format!("*{}\n", table.as_str()));
            for rule in rules.table(table) {
                out.push_str(&Self::line("-A", rule));
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        out
    }

    fn render_host(&self, rules: &HostRules) -> String {
        let mut out = String::from("*filter\n");
        out.push_str(&format!(":{} - [0:0]\n", rules.chain()));
        for rule in rules.rules() {
            out.push_str(&Self::line("-A", rule));
            out.push('\n');
        }
        // Insert the hooks last so the chain is complete before traffic enters it.
        for jump in rules.hook().jumps() {
            out.push_str(&format!("-I {} 1", jump.chain));
            for arg in Self::rule_args(&jump) {
                out.push(' ');
                out.push_str(&quote(&arg));
            }
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out
    }

    fn render_host_rollback(&self, hook: &HostHook) -> Vec<Vec<String>> {
        let mut commands: Vec<Vec<String>> = hook
            .jumps()
            .iter()
            .map(|jump| {
                let mut delete = vec!["-D".to_string(), jump.chain.clone()];
                delete.extend(Self::rule_args(jump));
                delete
            })
            .collect();
        commands.push(vec!["-F".to_string(), hook.chain.clone()]);
        commands.push(vec!["-X".to_string(), hook.chain.clone()]);
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::topology::NetworkTopology;
    use crate::sandbox::naming::SessionId;

    fn session() -> SessionId {
        SessionId::parse("0badcafe").unwrap()
    }

    #[test]
    fn test_render_redirection() {
        let rules = RedirectionRules::build(&NetworkTopology::default());
        let text = IptablesRenderer.render_redirection(&rules);

        assert!(text.starts_with("*nat\n-A OUTPUT -o lo -j RETURN\n"));
        assert!(text.contains("-A OUTPUT -d 127.0.0.0/8 -j RETURN\n"));
        assert!(text.contains("-A OUTPUT -p udp -d 8.8.8.8/32 --dport 53 -j RETURN\n"));
        assert!(text.contains("-A OUTPUT -d 172.30.0.10/32 -j RETURN\n"));
        assert!(text.contains("-A OUTPUT -p tcp --dport 80 -j DNAT --to-destination 172.30.0.10:3129\n"));
        assert!(text.contains("-A OUTPUT -p tcp --dport 443 -j DNAT --to-destination 172.30.0.10:3130\n"));
        assert!(text.contains("*filter\n-A OUTPUT -o lo -j ACCEPT\n"));
        assert!(text.contains("-A OUTPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT\n"));
        assert!(text.ends_with("-A OUTPUT -j DROP\nCOMMIT\n"));
        assert_eq!(text.matches("COMMIT").count(), 2);
    }

    #[test]
    fn test_nat_precedes_dnat_passthrough() {
        let rules = RedirectionRules::build(&NetworkTopology::default());
        let text = IptablesRenderer.render_redirection(&rules);
        let proxy_return = text.find("-d 172.30.0.10/32 -j RETURN").unwrap();
        let dnat = text.find("-j DNAT").unwrap();
        assert!(proxy_return < dnat);
    }

    #[test]
    fn test_render_host() {
        let rules = HostRules::build(&NetworkTopology::default(), &session());
        let text = IptablesRenderer.render_host(&rules);

        assert!(text.starts_with("*filter\n:EW-0badcafe - [0:0]\n"));
        assert!(text.contains("-A EW-0badcafe -s 172.30.0.10/32 -j ACCEPT\n"));
        assert!(text.contains("-A EW-0badcafe -p tcp -d 172.30.0.10/32 --dport 3128 -j ACCEPT\n"));
        assert!(text.contains("-A EW-0badcafe -j LOG --log-prefix \"[EW-0badcafe] \"\n"));
        assert!(text.contains("-A EW-0badcafe -j DROP\n"));
        assert!(text.ends_with(concat!(
            "-I DOCKER-USER 1 -i run-0badcafe-br -j EW-0badcafe\n",
            "-I INPUT 1 -i run-0badcafe-br -j EW-0badcafe\n",
            "COMMIT\n"
        )));
    }

    #[test]
    fn test_render_host_rollback() {
        let commands = IptablesRenderer.render_host_rollback(&HostHook::for_session(&session()));
        assert_eq!(
            commands,
            vec![
                vec!["-D", "DOCKER-USER", "-i", "run-0badcafe-br", "-j", "EW-0badcafe"],
                vec!["-D", "INPUT", "-i", "run-0badcafe-br", "-j", "EW-0badcafe"],
                vec!["-F", "EW-0badcafe"],
                vec!["-X", "EW-0badcafe"],
            ]
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("ACCEPT"), "ACCEPT");
        assert_eq!(quote("[EW-1] "), "\"[EW-1] \"");
    }
}
