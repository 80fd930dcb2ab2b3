use super::{Commander, DataplaneError, Result, run_checked};

const IPTABLES_BIN: &str = "iptables";

/// Verify-before-mutate wrapper around iptables. Adds never duplicate an
/// existing rule and removes tolerate an absent one.
#[derive(Clone)]
pub struct Iptables<C> {
    commander: C,
}

impl<C: Commander + Sync> Iptables<C> {
    pub fn new(commander: C) -> Self {
        Self { commander }
    }

    pub async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        let args = vec!["-t".into(), table.into(), "-n".into(), "-L".into(), chain.into()];
        self.probe(&args, &format!("list chain {table}/{chain}")).await
    }

    pub async fn ensure_chain(&self, table: &str, chain: &str) -> Result<()> {
        if self.chain_exists(table, chain).await? {
            return Ok(());
        }
        let args = vec!["-t".into(), table.into(), "-N".into(), chain.into()];
        run_checked(
            &self.commander,
            IPTABLES_BIN,
            &args,
            &format!("create chain {table}/{chain}"),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        for op in ["-F", "-X"] {
            let args = vec!["-t".into(), table.into(), op.into(), chain.into()];
            run_checked(
                &self.commander,
                IPTABLES_BIN,
                &args,
                &format!("delete chain {table}/{chain}"),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        let mut args = vec!["-t".into(), table.into(), "-C".into(), chain.into()];
        args.extend_from_slice(spec);
        self.probe(&args, &format!("check rule in {table}/{chain}")).await
    }

    pub async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<()> {
        if self.rule_exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec![
            "-t".into(),
            table.into(),
            "-I".into(),
            chain.into(),
            position.to_string(),
        ];
        args.extend_from_slice(spec);
        run_checked(
            &self.commander,
            IPTABLES_BIN,
            &args,
            &format!("insert rule in {table}/{chain}"),
        )
        .await?;
        Ok(())
    }

    pub async fn append_unique(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        if self.rule_exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t".into(), table.into(), "-A".into(), chain.into()];
        args.extend_from_slice(spec);
        run_checked(
            &self.commander,
            IPTABLES_BIN,
            &args,
            &format!("append rule in {table}/{chain}"),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_if_present(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        if !self.rule_exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t".into(), table.into(), "-D".into(), chain.into()];
        args.extend_from_slice(spec);
        run_checked(
            &self.commander,
            IPTABLES_BIN,
            &args,
            &format!("delete rule in {table}/{chain}"),
        )
        .await?;
        Ok(())
    }

    // A non-zero exit from a probe means "absent" unless the dataplane
    // rejected us outright.
    async fn probe(&self, args: &[String], context: &str) -> Result<bool> {
        let out = self.commander.output(IPTABLES_BIN, args).await?;
        if out.success() {
            return Ok(true);
        }
        match DataplaneError::from_output(context, &out) {
            e @ DataplaneError::Denied(_) => Err(e),
            e @ DataplaneError::Busy(_) => Err(e),
            _ => Ok(false),
        }
    }
}
