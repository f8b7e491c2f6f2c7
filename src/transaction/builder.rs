//! P2WPKH transaction assembly and signing

use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount as BtcAmount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;
use tracing::debug;

use crate::amount::Amount;
use crate::error::{Error, Result};

use super::{check_op_return, BuildOptions, SignedTransaction, SigningSecret, TxInput, TxOutput};

/// Builds signed transactions for one network
pub struct TransactionBuilder {
    network: Network,
    secp: Secp256k1<All>,
}

impl TransactionBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Parse an address and check it belongs to this builder's network
    pub fn parse_address(&self, address: &str) -> Result<Address> {
        address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?
            .require_network(self.network)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))
    }

    /// P2WPKH address controlled by the secret
    pub fn address_for(&self, secret: &SigningSecret) -> Result<Address> {
        let public_key = self.public_key(secret)?;
        Ok(Address::p2wpkh(&public_key, self.network))
    }

    fn public_key(&self, secret: &SigningSecret) -> Result<CompressedPublicKey> {
        let private_key = secret.private_key()?;
        CompressedPublicKey::from_private_key(&self.secp, &private_key)
            .map_err(|e| Error::InvalidSecret(e.to_string()))
    }

    /// Assemble and sign a transaction spending `inputs` to `outputs`
    ///
    /// Ordinary outputs keep the caller's order. An OP_RETURN payload, if
    /// present, becomes exactly one extra zero-value output after them.
    /// Every input is spent as P2WPKH of the secret's key.
    pub fn create_and_sign(
        &self,
        secret: &SigningSecret,
        inputs: &[TxInput],
        outputs: &[TxOutput],
        options: &BuildOptions,
    ) -> Result<SignedTransaction> {
        // Fail before any key material is touched
        check_op_return(options.op_return.as_deref())?;

        if inputs.is_empty() {
            return Err(Error::TransactionBuild("no inputs".to_string()));
        }
        if outputs.is_empty() && options.op_return.is_none() {
            return Err(Error::TransactionBuild("no outputs".to_string()));
        }

        let total_in = Amount::sum(inputs.iter().map(|i| &i.value))?;
        let total_out = Amount::sum(outputs.iter().map(|o| &o.value))?;
        if total_out > total_in {
            return Err(Error::TransactionBuild(format!(
                "outputs {} exceed inputs {}",
                total_out, total_in
            )));
        }

        let private_key = secret.private_key()?;
        let public_key = self.public_key(secret)?;
        let spend_script = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());

        let mut tx_outputs = Vec::with_capacity(outputs.len() + 1);
        for output in outputs {
            tx_outputs.push(TxOut {
                value: BtcAmount::from_sat(output.value.to_sat()),
                script_pubkey: self.parse_address(&output.address)?.script_pubkey(),
            });
        }
        if let Some(data) = &options.op_return {
            let push = PushBytesBuf::try_from(data.clone())
                .map_err(|e| Error::TransactionBuild(format!("OP_RETURN payload: {}", e)))?;
            tx_outputs.push(TxOut {
                value: BtcAmount::ZERO,
                script_pubkey: ScriptBuf::new_op_return(push),
            });
        }

        let tx_inputs = inputs
            .iter()
            .map(|input| {
                let txid = Txid::from_str(&input.txid).map_err(|e| {
                    Error::TransactionBuild(format!("input txid {}: {}", input.txid, e))
                })?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, input.output_index),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };

        let witnesses = {
            let mut cache = SighashCache::new(&tx);
            inputs
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            index,
                            &spend_script,
                            BtcAmount::from_sat(input.value.to_sat()),
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| Error::TransactionBuild(format!("sighash: {}", e)))?;
                    let message = Message::from_digest(sighash.to_byte_array());
                    let signature = ecdsa::Signature {
                        signature: self.secp.sign_ecdsa(&message, &private_key.inner),
                        sighash_type: EcdsaSighashType::All,
                    };
                    Ok(Witness::p2wpkh(&signature, &public_key.0))
                })
                .collect::<Result<Vec<_>>>()?
        };

        for (txin, witness) in tx.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }

        let signed = SignedTransaction {
            txid: tx.compute_txid().to_string(),
            tx_hex: bitcoin::consensus::encode::serialize_hex(&tx),
        };
        debug!(
            "Signed {} ({} inputs, {} outputs)",
            signed.txid,
            tx.input.len(),
            tx.output.len()
        );
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::PrivateKey;

    fn secret(byte: u8) -> SigningSecret {
        let key = PrivateKey::new(SecretKey::from_slice(&[byte; 32]).unwrap(), Network::Regtest);
        SigningSecret::new(key.to_wif())
    }

    fn address(byte: u8) -> String {
        let builder = TransactionBuilder::new(Network::Regtest);
        builder.address_for(&secret(byte)).unwrap().to_string()
    }

    fn input(value: u64) -> TxInput {
        TxInput {
            txid: "a".repeat(64),
            output_index: 0,
            value: Amount::from_sat(value),
        }
    }

    fn decode(signed: &SignedTransaction) -> Transaction {
        bitcoin::consensus::deserialize(&hex::decode(&signed.tx_hex).unwrap()).unwrap()
    }

    #[test]
    fn test_outputs_keep_order_with_op_return_last() {
        let builder = TransactionBuilder::new(Network::Regtest);
        let outputs = vec![
            TxOutput {
                address: address(2),
                value: Amount::from_sat(40_000),
            },
            TxOutput {
                address: address(3),
                value: Amount::from_sat(50_000),
            },
        ];
        let options = BuildOptions {
            op_return: Some(vec![7u8; 80]),
        };

        let signed = builder
            .create_and_sign(&secret(1), &[input(100_000)], &outputs, &options)
            .unwrap();
        let tx = decode(&signed);

        assert_eq!(tx.output.len(), 3);
        assert_eq!(
            tx.output[0].script_pubkey,
            builder.parse_address(&address(2)).unwrap().script_pubkey()
        );
        assert_eq!(tx.output[1].value, BtcAmount::from_sat(50_000));
        assert!(tx.output[2].script_pubkey.is_op_return());
        assert_eq!(tx.output[2].value, BtcAmount::ZERO);
        assert_eq!(signed.txid, tx.compute_txid().to_string());
    }

    #[test]
    fn test_oversize_op_return_fails_before_signing() {
        let builder = TransactionBuilder::new(Network::Regtest);
        let options = BuildOptions {
            op_return: Some(vec![0u8; 81]),
        };
        // An unusable secret proves signing never started
        let err = builder
            .create_and_sign(&SigningSecret::new("garbage"), &[input(1_000)], &[], &options)
            .unwrap_err();
        assert!(matches!(err, Error::OversizeAuxData { len: 81, max: 80 }));
    }

    #[test]
    fn test_signature_verifies() {
        let builder = TransactionBuilder::new(Network::Regtest);
        let outputs = vec![TxOutput {
            address: address(2),
            value: Amount::from_sat(9_000),
        }];
        let signed = builder
            .create_and_sign(&secret(1), &[input(10_000)], &outputs, &BuildOptions::default())
            .unwrap();
        let tx = decode(&signed);

        let public_key = builder.public_key(&secret(1)).unwrap();
        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 2);
        assert_eq!(witness[1], &public_key.to_bytes()[..]);

        let signature = ecdsa::Signature::from_slice(witness[0]).unwrap();
        let script = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(0, &script, BtcAmount::from_sat(10_000), EcdsaSighashType::All)
            .unwrap();
        let message = Message::from_digest(sighash.to_byte_array());
        let secp = Secp256k1::verification_only();
        assert!(secp
            .verify_ecdsa(&message, &signature.signature, &public_key.0)
            .is_ok());
    }

    #[test]
    fn test_rejects_wrong_network_and_overspend() {
        let builder = TransactionBuilder::new(Network::Regtest);
        let mainnet = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(matches!(
            builder.parse_address(mainnet),
            Err(Error::InvalidAddress(_))
        ));

        let outputs = vec![TxOutput {
            address: address(2),
            value: Amount::from_sat(20_000),
        }];
        let err = builder
            .create_and_sign(&secret(1), &[input(10_000)], &outputs, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::TransactionBuild(_)));
    }
}
