#[cfg(test)]
mod test {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;
    use std::process::Command;

    #[test]
    fn unknown_subcommand_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("flagd")?;

        cmd.arg("foobar");
        cmd.assert()
            .failure()
            .stderr(predicate::str::contains("unrecognized subcommand"));

        Ok(())
    }

    #[test]
    fn control_install_prints_received_token() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("flagd")?;

        cmd.arg("control").arg("install");
        cmd.assert().success().stdout(predicate::str::contains("Install"));

        Ok(())
    }
}
